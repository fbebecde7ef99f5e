//! Boundary to the acquisition engine that owns the rings and writes the samples.
//!
//! The coordinator only ever talks to the producer through [`AcquisitionBackend`]:
//! it looks up the channel descriptors once per session, then loops on
//! `wait_for_data` / `report_floor`. [`InProcessBackend`] is the implementation used
//! when the producer lives in the same process (the synthetic producer, tests).

use std::sync::Arc;

use crate::data::{ChannelBufferSet, ChannelDescriptor, ShotRange, MAX_CHANNELS};
use crate::handshake::{Handshake, WaitOutcome};

/// Operations the coordinator needs from the producer.
pub trait AcquisitionBackend: Send + Sync {
    /// Descriptor of `channel`; zero capacity or no store means disabled.
    fn channel_buffer(&self, channel: usize) -> ChannelDescriptor;

    /// Block until a new range is available or stop is requested.
    fn wait_for_data(&self) -> WaitOutcome;

    /// Non-blocking stop check.
    fn is_stop_requested(&self) -> bool;

    /// Tell the producer which shots may be evicted.
    fn report_floor(&self, floor: u64);

    /// Ask the producer side to stop and wake a blocked coordinator.
    fn request_stop(&self);

    /// Neutral handshake state for a new session.
    fn reset(&self) {}

    /// Size of the channel table.
    fn max_channels(&self) -> usize {
        MAX_CHANNELS
    }
}

/// Backend over rings and a [`Handshake`] shared with an in-process producer.
#[derive(Debug, Clone)]
pub struct InProcessBackend {
    buffers: ChannelBufferSet,
    handshake: Arc<Handshake>,
}

impl InProcessBackend {
    /// Wrap the producer's buffers and handshake.
    pub fn new(buffers: ChannelBufferSet, handshake: Arc<Handshake>) -> Self {
        Self { buffers, handshake }
    }

    /// The producer's buffers.
    pub fn buffers(&self) -> &ChannelBufferSet {
        &self.buffers
    }

    /// The shared handshake.
    pub fn handshake(&self) -> &Arc<Handshake> {
        &self.handshake
    }

    /// Producer convenience: publish a range.
    pub fn publish(&self, range: ShotRange) {
        self.handshake.publish(range);
    }
}

impl AcquisitionBackend for InProcessBackend {
    fn channel_buffer(&self, channel: usize) -> ChannelDescriptor {
        self.buffers.descriptor(channel)
    }

    fn wait_for_data(&self) -> WaitOutcome {
        self.handshake.wait_for_data()
    }

    fn is_stop_requested(&self) -> bool {
        self.handshake.is_stop_requested()
    }

    fn report_floor(&self, floor: u64) {
        self.handshake.report_floor(floor);
    }

    fn request_stop(&self) {
        self.handshake.request_stop();
    }

    fn reset(&self) {
        self.handshake.reset();
    }

    fn max_channels(&self) -> usize {
        self.buffers.len()
    }
}
