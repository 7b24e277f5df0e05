//! Single-producer single-consumer byte ring
//!
//! Capacity is a power of two and one byte is always left free, so
//! `read == write` unambiguously means empty. The producer stages bytes at a
//! private `reserve` index and publishes them with [`RingProducer::commit`];
//! until then the consumer cannot see them, which makes a multi-part record
//! appear all at once or not at all. [`RingProducer::rewind`] drops whatever
//! was staged since the last commit.
//!
//! Memory ordering:
//! - `write`: stored by the producer with Release on commit, loaded by the
//!   consumer with Acquire before it reads bytes
//! - `read`: stored by the consumer with Release after copying bytes out,
//!   loaded by the producer with Acquire before it reuses that space
//! - buffer bytes: plain copies, ordered by the index handoff above

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Smallest accepted capacity exponent
pub const MIN_CAPACITY_EXP: u32 = 4;
/// Largest accepted capacity exponent
pub const MAX_CAPACITY_EXP: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring capacity exponent {exp} outside {MIN_CAPACITY_EXP}..={MAX_CAPACITY_EXP}")]
    InvalidCapacity { exp: u32 },

    #[error("ring full: {requested} bytes requested, {available} available")]
    Full { requested: usize, available: usize },
}

/// Storage and indices shared by both ends
struct RingShared {
    storage: Box<[UnsafeCell<u8>]>,
    /// Capacity - 1
    mask: usize,
    /// Next byte the consumer will read
    read: AtomicUsize,
    /// End of committed bytes
    write: AtomicUsize,
}

// Each index is advanced by exactly one side, and a byte range is only ever
// touched by the side that currently owns it.
unsafe impl Sync for RingShared {}

impl RingShared {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn cell(&self, index: usize) -> *mut u8 {
        // Safety: index is masked to be within bounds
        UnsafeCell::raw_get(unsafe { self.storage.as_ptr().add(index & self.mask) })
    }

    /// Copy `bytes` into the ring starting at `start`, wrapping at the end
    ///
    /// # Safety
    /// The caller must own the `bytes.len()` bytes starting at `start`
    unsafe fn copy_in(&self, start: usize, bytes: &[u8]) {
        let start = start & self.mask;
        let first = bytes.len().min(self.capacity() - start);
        // Safety: both segments lie inside storage and are owned by the caller
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.cell(start), first);
            ptr::copy_nonoverlapping(bytes[first..].as_ptr(), self.cell(0), bytes.len() - first);
        }
    }

    /// Copy `out.len()` bytes out of the ring starting at `start`
    ///
    /// # Safety
    /// The bytes must have been committed and not yet released by the reader
    unsafe fn copy_out(&self, start: usize, out: &mut [u8]) {
        let start = start & self.mask;
        let first = out.len().min(self.capacity() - start);
        let len = out.len();
        // Safety: both segments lie inside storage and were published by the producer
        unsafe {
            ptr::copy_nonoverlapping(self.cell(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.cell(0), out[first..].as_mut_ptr(), len - first);
        }
    }
}

/// Writing end of the ring
pub struct RingProducer {
    shared: Arc<RingShared>,
    /// End of staged bytes; private to the producer
    reserve: usize,
}

/// Reading end of the ring
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

/// Create a ring of `1 << cap_exp` bytes
pub fn ring_buffer(cap_exp: u32) -> Result<(RingProducer, RingConsumer), RingError> {
    if !(MIN_CAPACITY_EXP..=MAX_CAPACITY_EXP).contains(&cap_exp) {
        return Err(RingError::InvalidCapacity { exp: cap_exp });
    }

    let capacity = 1usize << cap_exp;
    let storage: Vec<_> = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
    let shared = Arc::new(RingShared {
        storage: storage.into_boxed_slice(),
        mask: capacity - 1,
        read: AtomicUsize::new(0),
        write: AtomicUsize::new(0),
    });

    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
            reserve: 0,
        },
        RingConsumer { shared },
    ))
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes that can still be staged
    pub fn write_available(&self) -> usize {
        let read = self.shared.read.load(Ordering::Acquire);
        read.wrapping_sub(self.reserve).wrapping_sub(1) & self.shared.mask
    }

    /// Bytes staged but not yet committed
    pub fn pending(&self) -> usize {
        let write = self.shared.write.load(Ordering::Relaxed);
        self.reserve.wrapping_sub(write) & self.shared.mask
    }

    /// Stage `bytes` after any previously staged bytes
    ///
    /// All-or-nothing: on `Full` nothing is staged.
    pub fn reserve(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        let available = self.write_available();
        if bytes.len() > available {
            return Err(RingError::Full {
                requested: bytes.len(),
                available,
            });
        }

        // Safety: [reserve, reserve + len) is free space the consumer cannot see
        unsafe { self.shared.copy_in(self.reserve, bytes) };
        self.reserve = (self.reserve + bytes.len()) & self.shared.mask;
        Ok(())
    }

    /// Publish everything staged so far
    pub fn commit(&mut self) {
        self.shared.write.store(self.reserve, Ordering::Release);
    }

    /// Discard everything staged since the last commit
    pub fn rewind(&mut self) {
        self.reserve = self.shared.write.load(Ordering::Relaxed);
    }

    /// Stage and publish in one step
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        self.reserve(bytes)?;
        self.commit();
        Ok(())
    }
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Committed bytes not yet read
    pub fn read_available(&self) -> usize {
        let write = self.shared.write.load(Ordering::Acquire);
        let read = self.shared.read.load(Ordering::Relaxed);
        write.wrapping_sub(read) & self.shared.mask
    }

    /// Copy up to `out.len()` committed bytes out; returns the count
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.read_available());
        let read = self.shared.read.load(Ordering::Relaxed);

        // Safety: [read, read + count) was committed and is not yet released
        unsafe { self.shared.copy_out(read, &mut out[..count]) };
        self.shared
            .read
            .store((read + count) & self.shared.mask, Ordering::Release);
        count
    }
}
