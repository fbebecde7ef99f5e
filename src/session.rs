//! Acquisition session: the owner of the processor registry and the coordinator.
//!
//! A session is the explicit context object binding one backend to one registry.
//! Its lifecycle mirrors the coordinator's state machine:
//!
//! - **`register_processor` / `register_native` / `clear_processors`**: registry
//!   mutation, only while no coordinator thread is running.
//! - **`init`**: builds the [`ChannelBufferSet`] from the backend's descriptors and
//!   calls every processor's `init`.
//! - **`start`**: resets the handshake and spawns the coordinator, unless no
//!   processor takes part in the handshake, in which case the session stays idle.
//! - **`stop`** / **`await_finish`**: raise the stop flag, join the thread, take the
//!   registry back and `finish` every processor.
//!
//! Dropping a running session stops and joins the coordinator.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::backend::AcquisitionBackend;
use crate::coordinator::{
    Coordinator, CoordinatorHandle, CoordinatorSnapshot, CoordinatorState, CoordinatorStats,
    ProcessorFailure, StateCell,
};
use crate::data::ChannelBufferSet;
use crate::error::{AppResult, DaqError};
use crate::processor::{NativeTask, Processor, ProcessorRegistry};

/// Capacity of the processor failure channel.
pub const DIAGNOSTICS_CAPACITY: usize = 256;

/// Summary of a session for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Coordinator state.
    pub state: CoordinatorState,
    /// Whether a coordinator thread exists and has not exited yet.
    pub coordinator_alive: bool,
    /// Registered entries, native tokens included (0 while lent to the coordinator).
    pub registered: usize,
    /// Enabled channels of the current buffer set.
    pub enabled_channels: usize,
    /// Coordinator counters.
    pub stats: CoordinatorSnapshot,
}

/// One acquisition session over a backend.
pub struct AcquisitionSession {
    backend: Arc<dyn AcquisitionBackend>,
    registry: Option<ProcessorRegistry>,
    buffers: ChannelBufferSet,
    state: Arc<StateCell>,
    stats: Arc<CoordinatorStats>,
    coordinator: Option<CoordinatorHandle>,
    diagnostics_tx: mpsc::Sender<ProcessorFailure>,
    diagnostics_rx: Option<mpsc::Receiver<ProcessorFailure>>,
    initialized: bool,
}

impl AcquisitionSession {
    /// New idle session with an empty registry.
    pub fn new(backend: Arc<dyn AcquisitionBackend>) -> Self {
        let (diagnostics_tx, diagnostics_rx) = mpsc::channel(DIAGNOSTICS_CAPACITY);
        Self {
            backend,
            registry: Some(ProcessorRegistry::new()),
            buffers: ChannelBufferSet::default(),
            state: Arc::default(),
            stats: Arc::default(),
            coordinator: None,
            diagnostics_tx,
            diagnostics_rx: Some(diagnostics_rx),
            initialized: false,
        }
    }

    /// The registry, if it may be mutated.
    ///
    /// Mutation is allowed while no coordinator exists: `Idle`, or `Stopped` once the
    /// coordinator has been joined and the registry handed back. A `Stopped` session
    /// is finished and may be reset for the next one. A coordinator that is still
    /// `Running`/`Stopping`, or stopped but not yet joined, owns the registry.
    fn registry_mut(&mut self, operation: &'static str) -> AppResult<&mut ProcessorRegistry> {
        let state = self.state.load();
        let mutable = match state {
            CoordinatorState::Idle | CoordinatorState::Stopped => self.coordinator.is_none(),
            CoordinatorState::Running | CoordinatorState::Stopping => false,
        };
        match self.registry.as_mut() {
            Some(registry) if mutable => Ok(registry),
            _ => Err(DaqError::InvalidState {
                operation,
                state: state.to_string(),
            }),
        }
    }

    /// Append a handshake processor.
    pub fn register_processor(&mut self, processor: Box<dyn Processor>) -> AppResult<()> {
        self.registry_mut("register a processor")?.add(processor);
        Ok(())
    }

    /// Append a producer-native task token.
    pub fn register_native(&mut self, task: NativeTask) -> AppResult<()> {
        self.registry_mut("register a native task")?.add_native(task);
        Ok(())
    }

    /// Empty the registry, for a session reset.
    pub fn clear_processors(&mut self) -> AppResult<()> {
        self.registry_mut("clear processors")?.clear();
        self.initialized = false;
        Ok(())
    }

    /// Build the buffer set from the backend and initialise every processor.
    pub fn init(&mut self) -> AppResult<()> {
        let backend = self.backend.clone();
        let buffers = ChannelBufferSet::from_descriptors(backend.max_channels(), |channel| {
            backend.channel_buffer(channel)
        })?;

        let registry = self.registry_mut("initialise")?;
        registry.init_all(&buffers)?;
        info!(
            enabled_channels = buffers.enabled_count(),
            processors = registry.len(),
            participating = registry.participating_count(),
            "Session initialised"
        );

        self.buffers = buffers;
        self.state.store(CoordinatorState::Idle);
        self.initialized = true;
        Ok(())
    }

    /// Start acquisition processing.
    ///
    /// Initialises the session first if needed. With `wait` the call returns only
    /// after the coordinator has stopped and every processor has been finished, which
    /// requires someone else (usually the producer) to request the stop.
    pub fn start(&mut self, wait: bool) -> AppResult<()> {
        if self.coordinator.is_some() {
            return Err(DaqError::InvalidState {
                operation: "start",
                state: self.state.load().to_string(),
            });
        }
        if !self.initialized {
            self.init()?;
        }

        self.backend.reset();
        self.stats = Arc::default();

        let registry = self.registry.take().unwrap_or_default();
        if registry.participating_count() == 0 {
            info!(
                registered = registry.len(),
                "No handshake processors registered, coordinator not started"
            );
            self.registry = Some(registry);
            self.state.store(CoordinatorState::Idle);
            return Ok(());
        }

        let coordinator = Coordinator::new(registry, self.buffers.clone(), self.backend.clone())
            .with_state(self.state.clone())
            .with_stats(self.stats.clone())
            .with_diagnostics(self.diagnostics_tx.clone());
        match coordinator.spawn() {
            Ok(handle) => self.coordinator = Some(handle),
            Err(e) => {
                // The registry went down with the coordinator.
                self.registry = Some(ProcessorRegistry::new());
                self.initialized = false;
                return Err(e);
            }
        }

        if wait {
            self.await_finish()?;
        }
        Ok(())
    }

    /// Request the coordinator to stop. With `graceful` wait for it and finish.
    pub fn stop(&mut self, graceful: bool) -> AppResult<()> {
        self.backend.request_stop();
        if graceful {
            self.await_finish()
        } else {
            Ok(())
        }
    }

    /// Join the coordinator (if any) and finish every processor.
    ///
    /// Blocks until stop has been requested. Returns the first `finish` failure.
    pub fn await_finish(&mut self) -> AppResult<()> {
        if let Some(handle) = self.coordinator.take() {
            let registry = handle.join()?;
            self.registry = Some(registry);
        }
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut failures = match self.registry.as_mut() {
            Some(registry) => registry.finish_all(),
            None => Vec::new(),
        };
        let stats = self.stats.snapshot();
        info!(
            iterations = stats.iterations,
            failures = stats.failures,
            floor = stats.last_floor,
            "Session finished"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }

    /// Coordinator state.
    pub fn state(&self) -> CoordinatorState {
        self.state.load()
    }

    /// Coordinator counters.
    pub fn stats(&self) -> CoordinatorSnapshot {
        self.stats.snapshot()
    }

    /// Receiver of processor failures. Can be taken once.
    pub fn take_diagnostics(&mut self) -> Option<mpsc::Receiver<ProcessorFailure>> {
        self.diagnostics_rx.take()
    }

    /// The buffer set built by the last `init`.
    pub fn buffers(&self) -> &ChannelBufferSet {
        &self.buffers
    }

    /// The registry, `None` while lent to a running coordinator.
    pub fn registry(&self) -> Option<&ProcessorRegistry> {
        self.registry.as_ref()
    }

    /// Status summary.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state.load(),
            coordinator_alive: self
                .coordinator
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
            registered: self.registry.as_ref().map_or(0, ProcessorRegistry::len),
            enabled_channels: self.buffers.enabled_count(),
            stats: self.stats.snapshot(),
        }
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        if self.coordinator.is_some() {
            warn!("Session dropped while the coordinator is running, stopping it");
            self.backend.request_stop();
        }
        if let Err(e) = self.await_finish() {
            warn!(error = %e, "Session teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InProcessBackend;
    use crate::data::ShotRange;
    use crate::handshake::Handshake;
    use crate::processor::SampleOffset;

    fn session() -> (AcquisitionSession, Arc<Handshake>) {
        let handshake = Arc::new(Handshake::new());
        let buffers = ChannelBufferSet::allocate(8, &[0, 4], 32).unwrap();
        let backend = InProcessBackend::new(buffers, handshake.clone());
        (AcquisitionSession::new(Arc::new(backend)), handshake)
    }

    #[test]
    fn test_native_only_session_stays_idle() {
        let (mut session, _) = session();
        session.register_native(NativeTask::new("camera-dump")).unwrap();
        session.start(false).unwrap();

        let status = session.status();
        assert_eq!(status.state, CoordinatorState::Idle);
        assert!(!status.coordinator_alive);
        assert_eq!(status.registered, 1);
        assert_eq!(status.enabled_channels, 2);
        session.stop(true).unwrap();
    }

    #[test]
    fn test_registry_is_locked_while_running() {
        let (mut session, handshake) = session();
        session
            .register_processor(Box::new(SampleOffset::new("offset", 1)))
            .unwrap();
        session.start(false).unwrap();

        let err = session
            .register_processor(Box::new(SampleOffset::new("late", 1)))
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidState { .. }));
        assert!(session.clear_processors().is_err());
        assert!(session.start(false).is_err());

        handshake.publish(ShotRange::new(0, 3));
        session.stop(true).unwrap();
        assert_eq!(session.state(), CoordinatorState::Stopped);

        // Stopped and joined: the registry can be reset for the next session.
        session.clear_processors().unwrap();
        assert_eq!(session.registry().map(ProcessorRegistry::len), Some(0));
    }

    #[test]
    fn test_stopped_but_unjoined_coordinator_keeps_registry() {
        let (mut session, handshake) = session();
        session
            .register_processor(Box::new(SampleOffset::new("offset", 1)))
            .unwrap();
        session.start(false).unwrap();

        session.stop(false).unwrap();
        // Wait for the thread to exit without joining it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while session.state() != CoordinatorState::Stopped {
            assert!(std::time::Instant::now() < deadline, "coordinator did not stop");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(handshake.is_stop_requested());

        let err = session
            .register_processor(Box::new(SampleOffset::new("late", 1)))
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidState { .. }));

        session.await_finish().unwrap();
        session
            .register_processor(Box::new(SampleOffset::new("next", 1)))
            .unwrap();
        assert_eq!(session.registry().map(ProcessorRegistry::len), Some(2));
    }
}
