//! Per-channel ring buffers of one acquisition session.
//!
//! The set is a fixed-size table with one slot per possible channel. A slot is either
//! absent (the channel is disabled) or holds the channel's [`RingBuffer`] together with
//! its [`ChannelInfo`]. The table is built once per session from the producer's
//! channel descriptors and does not change until the next session.

use std::ops::Deref;

use crate::data::ring_buffer::{RingBuffer, SampleStore};
use crate::error::AppResult;

/// Element type of the acquisition buffers.
pub type SampleValue = u16;

/// Maximum number of ADC boards in one camera.
pub const MAX_BOARDS: usize = 4;
/// ADC chips per board.
pub const CHIPS_PER_BOARD: usize = 4;
/// Channels per ADC chip.
pub const CHANNELS_PER_CHIP: usize = 8;
/// Channels per board.
pub const CHANNELS_PER_BOARD: usize = CHIPS_PER_BOARD * CHANNELS_PER_CHIP;
/// Size of the channel table.
pub const MAX_CHANNELS: usize = MAX_BOARDS * CHANNELS_PER_BOARD;

/// Where a channel sits in the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelInfo {
    /// ADC board (0..MAX_BOARDS).
    pub board_number: usize,
    /// Chip within the board (0..CHIPS_PER_BOARD).
    pub chip_number: usize,
    /// Channel within the board (0..CHANNELS_PER_BOARD).
    pub channel_number: usize,
    /// Absolute channel number, the index into the channel table.
    pub absolute_channel_number: usize,
    /// Running index over the enabled channels only.
    pub enabled_channel_number: usize,
}

impl ChannelInfo {
    /// Derive board/chip/channel numbers from an absolute channel number.
    pub fn from_absolute(absolute_channel_number: usize, enabled_channel_number: usize) -> Self {
        let channel_number = absolute_channel_number % CHANNELS_PER_BOARD;
        Self {
            board_number: absolute_channel_number / CHANNELS_PER_BOARD,
            chip_number: channel_number / CHANNELS_PER_CHIP,
            channel_number,
            absolute_channel_number,
            enabled_channel_number,
        }
    }
}

/// Producer-side description of one channel's buffer.
///
/// A zero capacity or a missing store means the channel is disabled.
#[derive(Clone, Default)]
pub struct ChannelDescriptor {
    /// Number of addressable slots.
    pub capacity: usize,
    /// Backing store shared with the producer.
    pub store: Option<SampleStore<SampleValue>>,
}

impl ChannelDescriptor {
    /// Descriptor of a disabled channel.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Describe an existing ring buffer (sharing its store).
    pub fn from_ring(ring: &RingBuffer<SampleValue>) -> Self {
        Self {
            capacity: ring.capacity(),
            store: Some(ring.store().clone()),
        }
    }

    /// True if the descriptor stands for a disabled channel.
    pub fn is_disabled(&self) -> bool {
        self.capacity == 0 || self.store.is_none()
    }
}

impl std::fmt::Debug for ChannelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDescriptor")
            .field("capacity", &self.capacity)
            .field("store_len", &self.store.as_ref().map(|s| s.len()))
            .finish()
    }
}

/// One enabled channel: its ring buffer plus where it comes from.
#[derive(Debug, Clone)]
pub struct ChannelBuffer {
    info: ChannelInfo,
    ring: RingBuffer<SampleValue>,
}

impl ChannelBuffer {
    /// Channel metadata.
    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    /// The channel's ring buffer.
    pub fn ring(&self) -> &RingBuffer<SampleValue> {
        &self.ring
    }
}

impl Deref for ChannelBuffer {
    type Target = RingBuffer<SampleValue>;

    fn deref(&self) -> &Self::Target {
        &self.ring
    }
}

/// Fixed-size table of optional channel buffers.
///
/// Cloning is cheap; clones address the same sample stores.
#[derive(Debug, Clone, Default)]
pub struct ChannelBufferSet {
    channels: Vec<Option<ChannelBuffer>>,
}

impl ChannelBufferSet {
    /// Build the set by asking `describe` for each of the `max_channels` slots.
    ///
    /// # Errors
    /// Fails if a present descriptor has an invalid capacity or a too short store.
    pub fn from_descriptors<F>(max_channels: usize, mut describe: F) -> AppResult<Self>
    where
        F: FnMut(usize) -> ChannelDescriptor,
    {
        let mut channels = Vec::with_capacity(max_channels);
        let mut enabled = 0;
        for channel in 0..max_channels {
            let descriptor = describe(channel);
            let store = match descriptor.store {
                Some(store) if descriptor.capacity > 0 => store,
                _ => {
                    channels.push(None);
                    continue;
                }
            };
            let ring = RingBuffer::with_store(descriptor.capacity, store)?;
            channels.push(Some(ChannelBuffer {
                info: ChannelInfo::from_absolute(channel, enabled),
                ring,
            }));
            enabled += 1;
        }
        Ok(Self { channels })
    }

    /// Allocate fresh rings of `capacity` slots for the listed channels.
    ///
    /// Entries outside `0..max_channels` are ignored.
    pub fn allocate(max_channels: usize, enabled: &[usize], capacity: usize) -> AppResult<Self> {
        let mut rings: Vec<Option<RingBuffer<SampleValue>>> = vec![None; max_channels];
        for &channel in enabled {
            if channel < max_channels && rings[channel].is_none() {
                rings[channel] = Some(RingBuffer::new(capacity)?);
            }
        }
        Self::from_descriptors(max_channels, |channel| match &rings[channel] {
            Some(ring) => ChannelDescriptor::from_ring(ring),
            None => ChannelDescriptor::disabled(),
        })
    }

    /// Size of the channel table (enabled or not).
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True if the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of enabled channels.
    pub fn enabled_count(&self) -> usize {
        self.channels.iter().filter(|c| c.is_some()).count()
    }

    /// Buffer of `channel`, `None` if disabled or out of range.
    pub fn get(&self, channel: usize) -> Option<&ChannelBuffer> {
        self.channels.get(channel).and_then(Option::as_ref)
    }

    /// Whether `channel` is enabled.
    pub fn is_enabled(&self, channel: usize) -> bool {
        self.get(channel).is_some()
    }

    /// Enabled channels in absolute channel order.
    pub fn enabled(&self) -> impl Iterator<Item = &ChannelBuffer> {
        self.channels.iter().flatten()
    }

    /// Descriptor for `channel`, as a producer would report it.
    pub fn descriptor(&self, channel: usize) -> ChannelDescriptor {
        self.get(channel)
            .map(|buffer| ChannelDescriptor::from_ring(buffer.ring()))
            .unwrap_or_default()
    }

    /// Smallest capacity over the enabled channels.
    ///
    /// This bounds how far the producer may run ahead of the retention floor.
    pub fn min_capacity(&self) -> Option<usize> {
        self.enabled().map(|buffer| buffer.capacity()).min()
    }

    /// Read `channel` at `shot`; `None` for a disabled channel.
    pub fn read(&self, channel: usize, shot: u64) -> Option<SampleValue> {
        self.get(channel).map(|buffer| buffer.get(shot))
    }

    /// Write `channel` at `shot`; a disabled channel is a no-op.
    pub fn write(&self, channel: usize, shot: u64, value: SampleValue) {
        if let Some(buffer) = self.get(channel) {
            buffer.set(shot, value);
        }
    }
}
