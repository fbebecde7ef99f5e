//! In-place sample transform.

use super::{Processor, ShotCursor};
use crate::data::{ChannelBufferSet, SampleValue, ShotRange};

/// Adds a constant to every sample of every enabled channel, in place.
///
/// Strictly sequential: the floor is always the end of the processed range.
#[derive(Debug)]
pub struct SampleOffset {
    name: String,
    delta: SampleValue,
    cursor: ShotCursor,
    processed: u64,
}

impl SampleOffset {
    /// Create the processor.
    pub fn new(name: impl Into<String>, delta: SampleValue) -> Self {
        Self {
            name: name.into(),
            delta,
            cursor: ShotCursor::new(),
            processed: 0,
        }
    }

    /// Number of shots transformed so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl Processor for SampleOffset {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _buffers: &ChannelBufferSet) -> anyhow::Result<()> {
        self.cursor.reset();
        self.processed = 0;
        Ok(())
    }

    fn run(&mut self, buffers: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
        let pending = self.cursor.pending(range);
        for shot in pending.shots() {
            for channel in buffers.enabled() {
                channel.set(shot, channel.get(shot).wrapping_add(self.delta));
            }
        }
        self.processed += pending.len();
        Ok(self.cursor.advance(range.to))
    }

    fn cursor(&self) -> u64 {
        self.cursor.next()
    }
}
