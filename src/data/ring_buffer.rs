//! Fixed-capacity circular sample store addressed by a running shot counter.
//!
//! A `RingBuffer` never resets its indices. The producer and every consumer address
//! samples by a monotonically increasing 64-bit shot counter `k`, which lands in the
//! physical slot `k & (capacity - 1)`. This keeps channels that arrive through
//! different sockets aligned purely by their sample count, and makes "empty" and
//! "full" unambiguous for whoever tracks the counters (the handshake, not this type).
//!
//! # Memory Layout
//! ```text
//! store: [cell 0][cell 1] ... [cell capacity-1] ([extra cells...])
//!          ^ counter & mask
//! ```
//!
//! # Thread Safety
//!
//! The structure carries no lock. Each slot is an atomic cell accessed with relaxed
//! ordering, so a producer thread and the coordinator thread may touch the same store
//! without undefined behaviour; visibility of a whole shot range is established by the
//! release/acquire pair in [`crate::handshake::Handshake`]. Only the most recent
//! `capacity` shots are recoverable. Older shots are overwritten in place and no error
//! is signalled: keeping readers within that window is the job of the retention floor
//! protocol.
//!
//! Cloning a `RingBuffer` is cheap and shares the backing store, which is how the
//! producer hands a "borrowed" view of its buffers to the consumer side.

use std::fmt;
use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64, AtomicU8,
    Ordering,
};
use std::sync::Arc;

use crate::error::{AppResult, DaqError};

/// A fixed-width element that can live in a ring buffer slot.
///
/// Every implementation is backed by the matching `std::sync::atomic` integer so that
/// slot access never needs `unsafe`.
pub trait Sample: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Interior-mutable cell holding one element.
    type Cell: Send + Sync;

    /// Create a cell initialised to `value`.
    fn cell(value: Self) -> Self::Cell;

    /// Read the element stored in `cell`.
    fn load(cell: &Self::Cell) -> Self;

    /// Overwrite the element stored in `cell`.
    fn store(cell: &Self::Cell, value: Self);

    /// Lossy conversion used by statistical processors.
    fn to_f64(self) -> f64;
}

macro_rules! impl_sample {
    ($($ty:ty => $atomic:ty),* $(,)?) => {
        $(
            impl Sample for $ty {
                type Cell = $atomic;

                #[inline]
                fn cell(value: Self) -> Self::Cell {
                    <$atomic>::new(value)
                }

                #[inline]
                fn load(cell: &Self::Cell) -> Self {
                    cell.load(Ordering::Relaxed)
                }

                #[inline]
                fn store(cell: &Self::Cell, value: Self) {
                    cell.store(value, Ordering::Relaxed)
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_sample!(
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    i8 => AtomicI8,
    i16 => AtomicI16,
    i32 => AtomicI32,
    i64 => AtomicI64,
);

/// Shared backing store of a ring buffer.
pub type SampleStore<T> = Arc<[<T as Sample>::Cell]>;

/// Power-of-two circular store for one channel.
pub struct RingBuffer<T: Sample> {
    store: SampleStore<T>,
    mask: u64,
}

impl<T: Sample> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            mask: self.mask,
        }
    }
}

impl<T: Sample> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("store_len", &self.store.len())
            .field("store", &format!("{:p}", Arc::as_ptr(&self.store)))
            .finish()
    }
}

impl<T: Sample> RingBuffer<T> {
    /// Allocate a zero-initialised ring buffer with `capacity` slots.
    ///
    /// # Errors
    /// `DaqError::InvalidCapacity` if `capacity` is zero or not a power of two.
    ///
    /// # Example
    /// ```
    /// use apdcam_daq::data::ring_buffer::RingBuffer;
    ///
    /// let rb = RingBuffer::<u16>::new(8).unwrap();
    /// rb.set(9, 42);
    /// assert_eq!(rb.get(1), 42);
    /// assert!(RingBuffer::<u16>::new(12).is_err());
    /// ```
    pub fn new(capacity: usize) -> AppResult<Self> {
        validate_capacity(capacity)?;
        Self::with_store(capacity, Self::allocate_store(capacity))
    }

    /// Wrap an existing backing store.
    ///
    /// The store may be longer than `capacity` (producers sometimes keep extra room
    /// at the end); only the first `capacity` cells are addressed.
    ///
    /// # Errors
    /// `DaqError::InvalidCapacity` for a zero or non power-of-two capacity and
    /// `DaqError::BackingStoreTooSmall` if the store holds fewer than `capacity` cells.
    pub fn with_store(capacity: usize, store: SampleStore<T>) -> AppResult<Self> {
        validate_capacity(capacity)?;
        if store.len() < capacity {
            return Err(DaqError::BackingStoreTooSmall {
                capacity,
                len: store.len(),
            });
        }
        Ok(Self {
            store,
            mask: (capacity - 1) as u64,
        })
    }

    /// Allocate a default-initialised backing store of `len` cells.
    pub fn allocate_store(len: usize) -> SampleStore<T> {
        (0..len).map(|_| T::cell(T::default())).collect()
    }

    /// Number of addressable slots.
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Physical slot of a shot counter.
    #[inline]
    pub fn slot(&self, counter: u64) -> usize {
        (counter & self.mask) as usize
    }

    /// Read the element at `counter`.
    ///
    /// Never fails: the mask always yields a valid slot. Whether the value still
    /// belongs to shot `counter` depends on the producer not having advanced more than
    /// `capacity` shots past it.
    #[inline]
    pub fn get(&self, counter: u64) -> T {
        T::load(&self.store[self.slot(counter)])
    }

    /// Store `value` at `counter`.
    #[inline]
    pub fn set(&self, counter: u64, value: T) {
        T::store(&self.store[self.slot(counter)], value)
    }

    /// Append the elements of `[from, to)` to `out`, unfolding a wrapped range.
    pub fn copy_range(&self, from: u64, to: u64, out: &mut Vec<T>) {
        if to <= from {
            return;
        }
        out.reserve((to - from) as usize);
        out.extend((from..to).map(|counter| self.get(counter)));
    }

    /// Overwrite every addressable slot with `value`.
    pub fn fill(&self, value: T) {
        for cell in self.store.iter().take(self.capacity()) {
            T::store(cell, value);
        }
    }

    /// The shared backing store, e.g. to describe this buffer to another component.
    pub fn store(&self) -> &SampleStore<T> {
        &self.store
    }

    /// Whether `self` and `other` address the same backing store.
    pub fn shares_store_with(&self, other: &RingBuffer<T>) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

fn validate_capacity(capacity: usize) -> AppResult<()> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(DaqError::InvalidCapacity { capacity });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rejects_zero_and_non_power_of_two() {
        for capacity in [0usize, 3, 6, 12, 100, 1000, (1 << 20) + 1] {
            match RingBuffer::<u16>::new(capacity) {
                Err(DaqError::InvalidCapacity { capacity: c }) => assert_eq!(c, capacity),
                other => panic!("capacity {capacity} accepted: {:?}", other),
            }
        }
    }

    #[test]
    fn test_counter_maps_to_modulo_slot() {
        for shift in 0..12 {
            let capacity = 1usize << shift;
            let rb = RingBuffer::<u32>::new(capacity).unwrap();
            assert_eq!(rb.capacity(), capacity);
            for counter in [0u64, 1, 7, 8, 9, 1023, 1024, 1025, u64::MAX - 1] {
                assert_eq!(rb.slot(counter), (counter % capacity as u64) as usize);
            }
        }
    }

    #[test]
    fn test_wrap_around_overwrites_oldest() {
        let rb = RingBuffer::<u16>::new(8).unwrap();
        for counter in 0..10u64 {
            rb.set(counter, 100 + counter as u16);
        }

        assert_eq!(rb.get(9), 109);
        assert_eq!(rb.slot(9), 1);
        // Shot 1 shares slot 1 with shot 9 and has been overwritten.
        assert_eq!(rb.get(1), 109);
        // Shots 2..8 are still resident.
        for counter in 2..8u64 {
            assert_eq!(rb.get(counter), 100 + counter as u16);
        }
    }

    #[test]
    fn test_with_store_checks_length() {
        let store = RingBuffer::<u16>::allocate_store(4);
        match RingBuffer::<u16>::with_store(8, store) {
            Err(DaqError::BackingStoreTooSmall { capacity, len }) => {
                assert_eq!(capacity, 8);
                assert_eq!(len, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_longer_store_addresses_only_capacity() {
        let store = RingBuffer::<u16>::allocate_store(8 + 4);
        let rb = RingBuffer::<u16>::with_store(8, store).unwrap();
        rb.fill(7);
        rb.set(8, 1);
        assert_eq!(rb.get(0), 1);
        assert_eq!(rb.get(16), 1);
        assert_eq!(rb.get(3), 7);
    }

    #[test]
    fn test_clone_shares_store() {
        let producer = RingBuffer::<u16>::new(16).unwrap();
        let consumer = producer.clone();
        assert!(producer.shares_store_with(&consumer));

        producer.set(42, 0xBEEF);
        assert_eq!(consumer.get(42), 0xBEEF);

        let other = RingBuffer::<u16>::new(16).unwrap();
        assert!(!producer.shares_store_with(&other));
    }

    #[test]
    fn test_copy_range_unfolds_wrapped_range() {
        let rb = RingBuffer::<u8>::new(4).unwrap();
        for counter in 0..6u64 {
            rb.set(counter, counter as u8);
        }

        let mut out = Vec::new();
        rb.copy_range(2, 6, &mut out);
        assert_eq!(out, vec![2, 3, 4, 5]);

        out.clear();
        rb.copy_range(5, 5, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let rb = RingBuffer::<u64>::new(1024).unwrap();
        let writer_rb = rb.clone();

        let writer = thread::spawn(move || {
            for counter in 0..100_000u64 {
                writer_rb.set(counter, counter);
            }
        });

        // Values read while the writer is active always come from some past write
        // into that slot (or the initial zero), never a torn mix.
        for _ in 0..10_000 {
            let value = rb.get(5);
            assert!(value == 0 || value % 1024 == 5, "torn value {value}");
        }

        writer.join().unwrap();
        assert_eq!(rb.get(99_999), 99_999);
    }
}
