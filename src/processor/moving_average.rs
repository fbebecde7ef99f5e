//! Windowed analysis that keeps history resident in the rings.
//!
//! Instead of buffering samples itself, the processor reads the trailing window
//! straight from the ring buffers. That only works if the producer does not evict
//! those shots, so the retention floor trails `to` by `window - 1` shots.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Processor, ShotCursor};
use crate::data::{ChannelBufferSet, Sample, ShotRange};
use crate::error::{AppResult, DaqError};

/// Read access to the latest per-channel means of a [`MovingAverage`].
#[derive(Debug, Clone, Default)]
pub struct MovingAverageHandle {
    means: Arc<RwLock<Vec<Option<f64>>>>,
}

impl MovingAverageHandle {
    /// Latest mean of `channel`, `None` if disabled or not computed yet.
    pub fn mean(&self, channel: usize) -> Option<f64> {
        self.means.read().get(channel).copied().flatten()
    }

    /// Snapshot of every channel slot.
    pub fn means(&self) -> Vec<Option<f64>> {
        self.means.read().clone()
    }
}

/// Per-channel mean over the last `window` shots.
#[derive(Debug)]
pub struct MovingAverage {
    name: String,
    window: u64,
    cursor: ShotCursor,
    handle: MovingAverageHandle,
}

impl MovingAverage {
    /// Create the processor.
    ///
    /// # Errors
    /// `DaqError::Configuration` for a zero window.
    pub fn new(name: impl Into<String>, window: u64) -> AppResult<Self> {
        if window == 0 {
            return Err(DaqError::Configuration(
                "moving_average window must be at least 1".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            window,
            cursor: ShotCursor::new(),
            handle: MovingAverageHandle::default(),
        })
    }

    /// Handle for reading the results from another thread.
    pub fn handle(&self) -> MovingAverageHandle {
        self.handle.clone()
    }
}

impl Processor for MovingAverage {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, buffers: &ChannelBufferSet) -> anyhow::Result<()> {
        self.cursor.reset();
        *self.handle.means.write() = vec![None; buffers.len()];
        Ok(())
    }

    fn run(&mut self, buffers: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
        let pending = self.cursor.pending(range);
        if !pending.is_empty() {
            let newest = pending.to - 1;
            // Only shots inside the resident range may be touched.
            let oldest = (newest + 1).saturating_sub(self.window).max(range.from);
            let count = (newest + 1 - oldest) as f64;

            let mut means = self.handle.means.write();
            if means.len() < buffers.len() {
                means.resize(buffers.len(), None);
            }
            for channel in buffers.enabled() {
                let sum: f64 = (oldest..=newest).map(|shot| channel.get(shot).to_f64()).sum();
                means[channel.info().absolute_channel_number] = Some(sum / count);
            }
        }
        self.cursor.advance(range.to);
        Ok(range.to.saturating_sub(self.window - 1))
    }

    fn cursor(&self) -> u64 {
        self.cursor.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(buffers: &ChannelBufferSet, range: std::ops::Range<u64>) {
        for shot in range {
            for channel in buffers.enabled() {
                channel.set(shot, shot as u16);
            }
        }
    }

    #[test]
    fn test_zero_window_is_rejected() {
        assert!(MovingAverage::new("avg", 0).is_err());
    }

    #[test]
    fn test_floor_trails_by_window() {
        let buffers = ChannelBufferSet::allocate(2, &[1], 64).unwrap();
        let mut avg = MovingAverage::new("avg", 4).unwrap();
        avg.init(&buffers).unwrap();
        let handle = avg.handle();

        ramp(&buffers, 0..10);
        assert_eq!(avg.run(&buffers, ShotRange::new(0, 10)).unwrap(), 7);
        // Mean of shots 6, 7, 8, 9.
        assert_eq!(handle.mean(1), Some(7.5));
        assert_eq!(handle.mean(0), None);

        ramp(&buffers, 10..12);
        assert_eq!(avg.run(&buffers, ShotRange::new(7, 12)).unwrap(), 9);
        assert_eq!(handle.mean(1), Some(9.5));
        assert_eq!(avg.cursor(), 12);
    }

    #[test]
    fn test_window_is_clipped_to_resident_range() {
        let buffers = ChannelBufferSet::allocate(1, &[0], 16).unwrap();
        let mut avg = MovingAverage::new("avg", 8).unwrap();
        avg.init(&buffers).unwrap();

        ramp(&buffers, 0..3);
        assert_eq!(avg.run(&buffers, ShotRange::new(0, 3)).unwrap(), 0);
        assert_eq!(avg.handle().mean(0), Some(1.0));
    }
}
