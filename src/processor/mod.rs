//! Processors: consumers of shot ranges that report how much history they still need.
//!
//! Every loop iteration the coordinator hands each registered processor the full
//! [`ChannelBufferSet`] and a range `[from, to)` that is resident in all enabled
//! channels. A processor clamps the start of that range to its own progress (it may
//! already have digested part of it), processes the rest, advances its cursor to `to`
//! and returns its *retention floor*: the earliest shot it still needs kept in the
//! rings. Sequential processors return `to`; windowed ones return something earlier.
//!
//! ## Variants
//!
//! - [`diskdump::DiskDump`]: writes every enabled channel to its own text file.
//! - [`offset::SampleOffset`]: in-place transform of the samples.
//! - [`moving_average::MovingAverage`]: windowed analysis with a trailing floor.
//! - [`bridge::BridgeProcessor`]: forwards the call to a task in another runtime.
//! - [`registry::NativeTask`]: a token for a producer-native task that never takes
//!   part in the handshake.

pub mod bridge;
pub mod diskdump;
pub mod factory;
pub mod moving_average;
pub mod offset;
pub mod registry;

pub use bridge::{bridge, BridgeEndpoint, BridgeProcessor, BridgeRequest};
pub use diskdump::{DiskDump, DiskDumpConfig, DiskDumpControl};
pub use factory::ProcessorFactory;
pub use moving_average::{MovingAverage, MovingAverageHandle};
pub use offset::SampleOffset;
pub use registry::{NativeTask, ProcessorRegistry, RegisteredProcessor};

use crate::data::{ChannelBufferSet, ShotRange};

/// A stateful consumer of shot ranges.
///
/// Implementations run on the single coordinator thread, strictly one after the
/// other, so they never race each other. Errors (and panics) from `run` are isolated
/// by the coordinator: the processor is skipped for that iteration and its previous
/// floor stays in force.
pub trait Processor: Send {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Prepare for a new session. Called before acquisition starts.
    ///
    /// Implementations reset their cursor here.
    fn init(&mut self, buffers: &ChannelBufferSet) -> anyhow::Result<()> {
        let _ = buffers;
        Ok(())
    }

    /// Consume `range` and return the earliest shot that must stay resident.
    fn run(&mut self, buffers: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64>;

    /// Release resources after the coordinator has stopped.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// First shot this processor has not consumed yet.
    fn cursor(&self) -> u64;
}

/// Progress of a processor along the shot clock.
///
/// ```
/// use apdcam_daq::data::ShotRange;
/// use apdcam_daq::processor::ShotCursor;
///
/// let mut cursor = ShotCursor::new();
/// assert_eq!(cursor.pending(ShotRange::new(0, 5)), ShotRange::new(0, 5));
/// cursor.advance(5);
/// // The producer may hand out a range that overlaps what was already consumed.
/// assert_eq!(cursor.pending(ShotRange::new(2, 9)), ShotRange::new(5, 9));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShotCursor {
    next: u64,
}

impl ShotCursor {
    /// Cursor at shot 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// First shot not yet consumed.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// The part of `range` that has not been consumed yet.
    pub fn pending(&self, range: ShotRange) -> ShotRange {
        range.starting_at(self.next)
    }

    /// Mark everything before `to` as consumed. Never moves backwards.
    pub fn advance(&mut self, to: u64) -> u64 {
        self.next = self.next.max(to);
        self.next
    }

    /// Back to shot 0, for a new session.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}
