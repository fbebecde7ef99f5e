//! Sample buffers shared between the producer and the processors.
pub mod channel_set;
pub mod ring_buffer;
pub mod shot_range;

pub use channel_set::{
    ChannelBuffer, ChannelBufferSet, ChannelDescriptor, ChannelInfo, SampleValue, MAX_CHANNELS,
};
pub use ring_buffer::{RingBuffer, Sample, SampleStore};
pub use shot_range::ShotRange;
