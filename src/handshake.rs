//! Shared state between the producer and the coordinator thread.
//!
//! The producer publishes the range of shots that is resident in every enabled ring,
//! the coordinator blocks until such a range (or a stop request) arrives and answers
//! with the aggregate retention floor. Both directions are condition-variable waits;
//! nothing here spins.
//!
//! The stop flag and the floor are atomics (release on store, acquire on load) so
//! they can be polled without the lock. They are still *changed* while notifying
//! under the lock, which is what makes the waits free of lost wake-ups.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::data::ShotRange;

/// Result of a coordinator-side wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A new range is available.
    Data(ShotRange),
    /// Stop was requested; no processor may run any more.
    Stop,
}

/// Result of a producer-side wait for the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorWait {
    /// The floor reached the requested shot; carries the current floor.
    Reached(u64),
    /// Stop was requested before the floor got there.
    Stopped,
    /// The timeout expired first.
    TimedOut,
}

#[derive(Debug, Default)]
struct State {
    pending: Option<ShotRange>,
}

/// Producer/coordinator rendezvous.
///
/// Cheap to share behind an `Arc`. A published range that has not been consumed yet
/// is replaced by a newer one: the newer range always starts at or after the floor,
/// so it is the one that is safe to read.
#[derive(Debug, Default)]
pub struct Handshake {
    state: Mutex<State>,
    data_ready: Condvar,
    floor_changed: Condvar,
    stop: AtomicBool,
    floor: AtomicU64,
    published: AtomicU64,
    taken: AtomicU64,
    reports: AtomicU64,
}

impl Handshake {
    /// Fresh handshake: no pending range, floor 0, not stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to the neutral state for a new session.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        self.stop.store(false, Ordering::Release);
        self.floor.store(0, Ordering::Release);
        self.published.store(0, Ordering::Release);
        self.taken.store(0, Ordering::Release);
        self.reports.store(0, Ordering::Release);
    }

    // Producer side.

    /// Make `range` available to the coordinator and wake it.
    pub fn publish(&self, range: ShotRange) {
        let mut state = self.state.lock();
        if let Some(previous) = state.pending.replace(range) {
            trace!(%previous, %range, "Unconsumed range superseded");
        }
        self.published.fetch_add(1, Ordering::AcqRel);
        self.data_ready.notify_one();
    }

    /// Raise the stop condition and wake both sides.
    pub fn request_stop(&self) {
        let _state = self.state.lock();
        self.stop.store(true, Ordering::Release);
        self.data_ready.notify_all();
        self.floor_changed.notify_all();
    }

    /// Latest floor reported by the coordinator.
    pub fn floor(&self) -> u64 {
        self.floor.load(Ordering::Acquire)
    }

    /// Block until the floor is at least `min`, stop is requested, or `timeout` passes.
    pub fn wait_for_floor(&self, min: u64, timeout: Duration) -> FloorWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let floor = self.floor();
            if floor >= min {
                return FloorWait::Reached(floor);
            }
            if self.is_stop_requested() {
                return FloorWait::Stopped;
            }
            if self
                .floor_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                let floor = self.floor();
                return if floor >= min {
                    FloorWait::Reached(floor)
                } else {
                    FloorWait::TimedOut
                };
            }
        }
    }

    /// Block until every published range has been taken and answered with a floor.
    ///
    /// Returns `Reached` with the final floor, `Stopped` if stop was requested first.
    pub fn wait_until_drained(&self, timeout: Duration) -> FloorWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let drained = state.pending.is_none()
                && self.reports.load(Ordering::Acquire) >= self.taken.load(Ordering::Acquire);
            if drained {
                return FloorWait::Reached(self.floor());
            }
            if self.is_stop_requested() {
                return FloorWait::Stopped;
            }
            if self
                .floor_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return FloorWait::TimedOut;
            }
        }
    }

    /// Number of ranges published since the last reset.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    // Coordinator side.

    /// Non-blocking stop check.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Block until a range is published or stop is requested.
    ///
    /// Stop wins over a pending range.
    pub fn wait_for_data(&self) -> WaitOutcome {
        let mut state = self.state.lock();
        loop {
            if self.is_stop_requested() {
                return WaitOutcome::Stop;
            }
            if let Some(range) = state.pending.take() {
                self.taken.fetch_add(1, Ordering::AcqRel);
                return WaitOutcome::Data(range);
            }
            self.data_ready.wait(&mut state);
        }
    }

    /// Publish a new floor to the producer. The stored floor never decreases.
    pub fn report_floor(&self, floor: u64) {
        let _state = self.state.lock();
        self.floor.fetch_max(floor, Ordering::AcqRel);
        self.reports.fetch_add(1, Ordering::AcqRel);
        self.floor_changed.notify_all();
    }

    /// Number of floor reports (coordinator iterations) since the last reset.
    pub fn iterations(&self) -> u64 {
        self.reports.load(Ordering::Acquire)
    }
}
