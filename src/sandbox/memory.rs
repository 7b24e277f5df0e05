//! Guest linear memory and the boundary validator
//!
//! Every host function that receives a guest pointer resolves it here before
//! touching a single byte. The validator is a pure check against the current
//! committed size:
//!
//! ```text
//! accept(offset, length)  <=>  offset <= committed && length <= committed - offset
//! ```
//!
//! Both sides are computed without overflow, so `u32::MAX` offsets and
//! `u64::MAX` lengths are rejected rather than wrapped.
//!
//! Storage is reserved once at construction. Growth commits zeroed bytes
//! inside the reservation, so the base address never moves while the guest
//! runs. Only the guest-execution thread owns a `GuestMemory`; there is no
//! lock because no other thread can reach it.

use bytemuck::Pod;
use std::mem::size_of;
use std::ops::Range;
use thiserror::Error;

/// Guest page size in bytes (64KB)
pub const PAGE_SIZE: u64 = 65536;

/// Upper bound of the 32-bit guest address space
pub const MAX_GUEST_BYTES: u64 = 1 << 32;

/// A guest range that does not lie inside committed memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "guest range out of bounds: offset {offset} + length {length} > committed size {committed}"
)]
pub struct BoundsError {
    pub offset: u32,
    pub length: u64,
    pub committed: u64,
}

/// Errors from reserving or growing guest memory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("reservation of {reserved} bytes exceeds the 4 GiB guest address space")]
    ReservationTooLarge { reserved: u64 },

    #[error("initial size {initial} exceeds reservation {reserved}")]
    InitialExceedsReservation { initial: u64, reserved: u64 },

    #[error("out of guest memory: requested {requested} bytes, only {available} available")]
    OutOfReservation { requested: u64, available: u64 },
}

/// Round `bytes` up to a whole number of pages
fn page_align(bytes: u64) -> Option<u64> {
    bytes
        .checked_add(PAGE_SIZE - 1)
        .map(|b| b & !(PAGE_SIZE - 1))
}

/// The guest's single contiguous, growable address space
pub struct GuestMemory {
    /// Committed bytes; `data.capacity()` covers the whole reservation
    data: Vec<u8>,
    /// Reserved size in bytes
    reserved: u64,
}

impl GuestMemory {
    /// Reserve `reserved` bytes and commit the first `initial` bytes
    ///
    /// Both sizes are rounded up to whole pages.
    pub fn new(initial: u64, reserved: u64) -> Result<Self, MemoryError> {
        let reserved = page_align(reserved)
            .filter(|r| *r <= MAX_GUEST_BYTES)
            .ok_or(MemoryError::ReservationTooLarge { reserved })?;
        let initial = page_align(initial)
            .filter(|i| *i <= reserved)
            .ok_or(MemoryError::InitialExceedsReservation { initial, reserved })?;

        let mut data = Vec::with_capacity(reserved as usize);
        data.resize(initial as usize, 0);

        Ok(Self { data, reserved })
    }

    /// Committed size in bytes
    pub fn committed_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Reserved size in bytes
    pub fn reserved_size(&self) -> u64 {
        self.reserved
    }

    /// Host address of guest offset 0
    pub fn base_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Commit `bytes` more memory (rounded up to pages)
    ///
    /// Returns the previous committed size, which is the guest offset of the
    /// newly committed region.
    pub fn grow(&mut self, bytes: u64) -> Result<u32, MemoryError> {
        let committed = self.committed_size();
        let available = self.reserved - committed;
        let requested = page_align(bytes).unwrap_or(u64::MAX);

        if requested > available {
            return Err(MemoryError::OutOfReservation {
                requested: bytes,
                available,
            });
        }

        // Stays inside the reserved capacity, so the buffer is not reallocated
        self.data.resize((committed + requested) as usize, 0);
        Ok(committed as u32)
    }

    // =========================================================================
    // Boundary validator
    // =========================================================================

    /// Prove that `[offset, offset + length)` lies inside committed memory
    ///
    /// On success returns the host index range addressing exactly `length`
    /// bytes.
    pub fn validate(&self, offset: u32, length: u64) -> Result<Range<usize>, BoundsError> {
        let committed = self.committed_size();
        let start = offset as u64;

        if start > committed || length > committed - start {
            return Err(BoundsError {
                offset,
                length,
                committed,
            });
        }

        let start = start as usize;
        Ok(start..start + length as usize)
    }

    /// Validate `count` elements of `T` starting at `offset`
    pub fn array_range<T>(&self, offset: u32, count: u64) -> Result<Range<usize>, BoundsError> {
        let length = count
            .checked_mul(size_of::<T>() as u64)
            .ok_or(BoundsError {
                offset,
                length: u64::MAX,
                committed: self.committed_size(),
            })?;
        self.validate(offset, length)
    }

    /// Borrow a validated guest range
    pub fn slice(&self, offset: u32, length: u64) -> Result<&[u8], BoundsError> {
        let range = self.validate(offset, length)?;
        Ok(&self.data[range])
    }

    /// Mutably borrow a validated guest range
    pub fn slice_mut(&mut self, offset: u32, length: u64) -> Result<&mut [u8], BoundsError> {
        let range = self.validate(offset, length)?;
        Ok(&mut self.data[range])
    }

    /// Guest string given as pointer + length
    pub fn str8(&self, ptr: u32, len: u32) -> Result<&[u8], BoundsError> {
        self.slice(ptr, len as u64)
    }

    /// Null-terminated guest string, not including the terminator
    ///
    /// The scan is bounded by committed memory; a string that runs off the
    /// end without a terminator is out of bounds.
    pub fn cstr(&self, offset: u32) -> Result<&[u8], BoundsError> {
        let committed = self.committed_size();
        let rest = self.slice(offset, committed.saturating_sub(offset as u64))?;

        match rest.iter().position(|&b| b == 0) {
            Some(end) => Ok(&rest[..end]),
            None => Err(BoundsError {
                offset,
                length: rest.len() as u64 + 1,
                committed,
            }),
        }
    }

    /// Read a plain-old-data value at `offset`
    pub fn read_pod<T: Pod>(&self, offset: u32) -> Result<T, BoundsError> {
        let bytes = self.slice(offset, size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Write a plain-old-data value at `offset`
    pub fn write_pod<T: Pod>(&mut self, offset: u32, value: &T) -> Result<(), BoundsError> {
        let bytes = self.slice_mut(offset, size_of::<T>() as u64)?;
        bytes.copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Read `count` consecutive values of `T` at `offset`
    pub fn read_pod_array<T: Pod>(&self, offset: u32, count: u64) -> Result<Vec<T>, BoundsError> {
        let range = self.array_range::<T>(offset, count)?;
        Ok(self.data[range]
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}
