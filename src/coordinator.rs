//! The coordinator loop: the single consumer-side thread.
//!
//! Each iteration blocks until the producer publishes a range, runs every
//! participating processor on it in registration order, and reports the aggregate
//! retention floor back. Stop is checked before blocking, right after waking, and
//! before each processor; once it has been seen no further processor is started,
//! but the floor of the processors that already ran in the current iteration is
//! still reported.
//!
//! A processor that returns an error or panics is skipped for that iteration. It
//! keeps contributing its last successful floor (or nothing, if it never succeeded),
//! and the failure is logged and sent to the session owner as a [`ProcessorFailure`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::backend::AcquisitionBackend;
use crate::data::{ChannelBufferSet, ShotRange};
use crate::error::{AppResult, DaqError};
use crate::handshake::WaitOutcome;
use crate::processor::ProcessorRegistry;

/// Name of the coordinator thread.
pub const COORDINATOR_THREAD_NAME: &str = "daq-coordinator";

/// Lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoordinatorState {
    /// No thread running.
    Idle = 0,
    /// Loop active.
    Running = 1,
    /// Stop observed, the loop is winding down.
    Stopping = 2,
    /// Thread finished.
    Stopped = 3,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CoordinatorState::Running,
            2 => CoordinatorState::Stopping,
            3 => CoordinatorState::Stopped,
            _ => CoordinatorState::Idle,
        }
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Running => "running",
            CoordinatorState::Stopping => "stopping",
            CoordinatorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Coordinator state readable from other threads.
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            value: AtomicU8::new(CoordinatorState::Idle as u8),
        }
    }
}

impl StateCell {
    /// Current state.
    pub fn load(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Set the state.
    pub fn store(&self, state: CoordinatorState) {
        self.value.store(state as u8, Ordering::Release);
    }
}

/// Counters updated by the coordinator thread.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    iterations: AtomicU64,
    invocations: AtomicU64,
    failures: AtomicU64,
    dropped_diagnostics: AtomicU64,
    last_floor: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    /// Iterations that ran at least one processor and reported a floor.
    pub iterations: u64,
    /// `run` calls made.
    pub invocations: u64,
    /// `run` calls that returned an error or panicked.
    pub failures: u64,
    /// Failures not delivered because the diagnostics channel was full.
    pub dropped_diagnostics: u64,
    /// Last floor reported to the producer.
    pub last_floor: u64,
}

impl CoordinatorStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            iterations: self.iterations.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dropped_diagnostics: self.dropped_diagnostics.load(Ordering::Relaxed),
            last_floor: self.last_floor.load(Ordering::Relaxed),
        }
    }
}

/// A processor failure observed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorFailure {
    /// Processor name.
    pub processor: String,
    /// Iteration number (1-based).
    pub iteration: u64,
    /// The range the processor was given.
    pub range: ShotRange,
    /// Error chain or panic message.
    pub message: String,
}

impl From<ProcessorFailure> for DaqError {
    fn from(failure: ProcessorFailure) -> Self {
        DaqError::Processor {
            name: failure.processor,
            message: failure.message,
        }
    }
}

/// The loop, ready to be run on the current thread or spawned.
pub struct Coordinator {
    registry: ProcessorRegistry,
    buffers: ChannelBufferSet,
    backend: Arc<dyn AcquisitionBackend>,
    state: Arc<StateCell>,
    stats: Arc<CoordinatorStats>,
    diagnostics: Option<mpsc::Sender<ProcessorFailure>>,
    floors: Vec<Option<u64>>,
    reported: Option<u64>,
}

impl Coordinator {
    /// Coordinator over `registry`, reading `buffers` and talking to `backend`.
    pub fn new(
        registry: ProcessorRegistry,
        buffers: ChannelBufferSet,
        backend: Arc<dyn AcquisitionBackend>,
    ) -> Self {
        Self {
            registry,
            buffers,
            backend,
            state: Arc::default(),
            stats: Arc::default(),
            diagnostics: None,
            floors: Vec::new(),
            reported: None,
        }
    }

    /// Share the state cell with the session.
    pub fn with_state(mut self, state: Arc<StateCell>) -> Self {
        self.state = state;
        self
    }

    /// Share the counters with the session.
    pub fn with_stats(mut self, stats: Arc<CoordinatorStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Send failures to `sender` (non-blocking; dropped and counted when full).
    pub fn with_diagnostics(mut self, sender: mpsc::Sender<ProcessorFailure>) -> Self {
        self.diagnostics = Some(sender);
        self
    }

    /// Run the loop on a dedicated, named thread.
    pub fn spawn(self) -> AppResult<CoordinatorHandle> {
        let state = self.state.clone();
        state.store(CoordinatorState::Running);
        let thread = thread::Builder::new()
            .name(COORDINATOR_THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|e| {
                state.store(CoordinatorState::Idle);
                DaqError::ThreadSpawn(e.to_string())
            })?;
        Ok(CoordinatorHandle { thread, state })
    }

    /// Run the loop on the current thread until stop is observed.
    ///
    /// Returns the registry so its processors can be finished.
    pub fn run(mut self) -> ProcessorRegistry {
        let span = info_span!("coordinator", processors = self.registry.participating_count());
        let _enter = span.enter();

        self.state.store(CoordinatorState::Running);
        self.floors = vec![None; self.registry.participating_count()];
        info!("Coordinator started");

        loop {
            if self.backend.is_stop_requested() {
                break;
            }
            let range = match self.backend.wait_for_data() {
                WaitOutcome::Data(range) => range,
                WaitOutcome::Stop => break,
            };
            if self.backend.is_stop_requested() {
                debug!(%range, "Stop observed after wake-up, range not processed");
                break;
            }
            self.iterate(range);
        }

        self.state.store(CoordinatorState::Stopping);
        let stats = self.stats.snapshot();
        info!(
            iterations = stats.iterations,
            failures = stats.failures,
            floor = stats.last_floor,
            "Coordinator stopped"
        );
        self.state.store(CoordinatorState::Stopped);
        self.registry
    }

    fn iterate(&mut self, range: ShotRange) {
        let iteration = self.stats.iterations.load(Ordering::Relaxed) + 1;
        let mut invoked = 0usize;

        for (index, processor) in self.registry.participating_mut().enumerate() {
            if self.backend.is_stop_requested() {
                debug!(
                    processor = processor.name(),
                    "Stop observed, remaining processors skipped"
                );
                break;
            }

            invoked += 1;
            self.stats.invocations.fetch_add(1, Ordering::Relaxed);
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| processor.run(&self.buffers, range)));

            let message = match outcome {
                Ok(Ok(floor)) => {
                    trace!(processor = processor.name(), floor, "Processor finished range");
                    self.floors[index] = Some(floor);
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            error!(
                processor = processor.name(),
                iteration,
                %range,
                error = %message,
                "Processor failed, skipped for this iteration"
            );
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            let failure = ProcessorFailure {
                processor: processor.name().to_string(),
                iteration,
                range,
                message,
            };
            if let Some(sender) = &self.diagnostics {
                if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(failure) {
                    self.stats.dropped_diagnostics.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if invoked == 0 {
            return;
        }

        let floor = self.aggregate(range.to);
        self.backend.report_floor(floor);
        self.reported = Some(floor);
        self.stats.last_floor.store(floor, Ordering::Relaxed);
        self.stats.iterations.store(iteration, Ordering::Relaxed);
        debug!(%range, floor, invoked, "Floor reported");
    }

    /// Minimum over the known floors and `to`, never below the previous report.
    fn aggregate(&self, to: u64) -> u64 {
        let requested = self.floors.iter().flatten().copied().fold(to, u64::min);
        match self.reported {
            Some(previous) if requested < previous => {
                warn!(
                    requested,
                    previous, "Processor asked for shots below the reported floor, they may be gone"
                );
                previous
            }
            _ => requested,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle of a spawned coordinator thread.
#[derive(Debug)]
pub struct CoordinatorHandle {
    thread: JoinHandle<ProcessorRegistry>,
    state: Arc<StateCell>,
}

impl CoordinatorHandle {
    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        self.state.load()
    }

    /// Wait for the thread and take the registry back.
    pub fn join(self) -> AppResult<ProcessorRegistry> {
        self.thread.join().map_err(|payload| {
            self.state.store(CoordinatorState::Stopped);
            DaqError::ThreadSpawn(format!(
                "coordinator thread panicked: {}",
                panic_message(payload.as_ref())
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InProcessBackend;
    use crate::handshake::Handshake;
    use crate::processor::{Processor, ShotCursor};
    use tracing_test::traced_test;

    enum Behaviour {
        Floor(u64),
        Fail,
        Panic,
        StopAfter,
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        handshake: Arc<Handshake>,
        cursor: ShotCursor,
    }

    impl Processor for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&mut self, _: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
            match self.behaviour {
                Behaviour::Floor(floor) => {
                    self.cursor.advance(range.to);
                    Ok(floor)
                }
                Behaviour::Fail => anyhow::bail!("sensor offline"),
                Behaviour::Panic => panic!("index out of bounds"),
                Behaviour::StopAfter => {
                    self.handshake.request_stop();
                    Ok(self.cursor.advance(range.to))
                }
            }
        }

        fn cursor(&self) -> u64 {
            self.cursor.next()
        }
    }

    fn setup(behaviours: Vec<(&'static str, Behaviour)>) -> (Coordinator, Arc<Handshake>) {
        let handshake = Arc::new(Handshake::new());
        let buffers = ChannelBufferSet::allocate(4, &[0, 1], 64).unwrap();
        let mut registry = ProcessorRegistry::new();
        for (name, behaviour) in behaviours {
            registry.add(Box::new(Scripted {
                name,
                behaviour,
                handshake: handshake.clone(),
                cursor: ShotCursor::new(),
            }));
        }
        let backend = Arc::new(InProcessBackend::new(buffers.clone(), handshake.clone()));
        (Coordinator::new(registry, buffers, backend), handshake)
    }

    #[test]
    fn test_reports_minimum_of_processor_floors() {
        let (coordinator, handshake) = setup(vec![
            ("a", Behaviour::Floor(5)),
            ("b", Behaviour::Floor(3)),
            ("stop", Behaviour::StopAfter),
        ]);
        handshake.publish(ShotRange::new(0, 10));
        let stats = Arc::new(CoordinatorStats::default());
        let registry = coordinator.with_stats(stats.clone()).run();

        assert_eq!(handshake.floor(), 3);
        assert_eq!(handshake.iterations(), 1);
        assert_eq!(stats.snapshot().last_floor, 3);
        assert_eq!(stats.snapshot().invocations, 3);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    #[traced_test]
    fn test_failures_and_panics_are_isolated_and_logged() {
        let (coordinator, handshake) = setup(vec![
            ("broken", Behaviour::Fail),
            ("crashing", Behaviour::Panic),
            ("healthy", Behaviour::Floor(8)),
            ("stop", Behaviour::StopAfter),
        ]);
        let (sender, mut receiver) = mpsc::channel(1);
        let stats = Arc::new(CoordinatorStats::default());
        handshake.publish(ShotRange::new(0, 10));

        coordinator
            .with_diagnostics(sender)
            .with_stats(stats.clone())
            .run();

        // Failed processors contribute nothing, so only "healthy" and "stop" count.
        assert_eq!(handshake.floor(), 8);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.dropped_diagnostics, 1);

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.processor, "broken");
        assert_eq!(first.iteration, 1);
        assert!(first.message.contains("sensor offline"));
        assert!(receiver.try_recv().is_err());

        assert!(logs_contain("Processor failed"));
        assert!(logs_contain("sensor offline"));
        assert!(logs_contain("index out of bounds"));
    }

    #[test]
    fn test_stop_before_first_range_runs_nothing() {
        let (coordinator, handshake) = setup(vec![("a", Behaviour::Floor(1))]);
        handshake.publish(ShotRange::new(0, 10));
        handshake.request_stop();
        let state = Arc::new(StateCell::default());
        coordinator.with_state(state.clone()).run();

        assert_eq!(handshake.iterations(), 0);
        assert_eq!(state.load(), CoordinatorState::Stopped);
    }

    #[test]
    fn test_spawned_thread_is_named_and_joinable() {
        let (coordinator, handshake) = setup(vec![("a", Behaviour::Floor(4))]);
        let handle = coordinator.spawn().unwrap();
        assert_ne!(handle.state(), CoordinatorState::Idle);

        handshake.publish(ShotRange::new(0, 4));
        assert_eq!(
            handshake.wait_for_floor(4, std::time::Duration::from_secs(5)),
            crate::handshake::FloorWait::Reached(4)
        );
        handshake.request_stop();
        let registry = handle.join().unwrap();
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn test_failure_converts_to_recoverable_error() {
        let failure = ProcessorFailure {
            processor: "dump".to_string(),
            iteration: 3,
            range: ShotRange::new(10, 20),
            message: "disk full".to_string(),
        };
        let error = DaqError::from(failure);
        assert!(error.is_recoverable());
        assert_eq!(error.to_string(), "Processor 'dump' failed: disk full");
    }
}
