//! Size-classed payload arena
//!
//! Variable-length payloads (guest log text) are carved out of one
//! preallocated buffer. Each allocation is rounded up to a power-of-two size
//! class between 16 bytes and 4 KiB. Blocks are managed buddy-style: a larger
//! free block is split to serve a smaller class, and a freed block merges
//! with its free buddy, so space released by one class can serve any other.
//!
//! The buffer starts out as a run of naturally aligned top-level blocks,
//! largest first. A block at `offset` of size `s` has its buddy at
//! `offset ^ s`; for a top-level block that address lies past the end of
//! its run, so top-level blocks never merge with each other.

use std::collections::BTreeSet;

/// Block sizes, smallest first
pub const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Largest payload a single block can hold
pub const MAX_PAYLOAD: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

const CLASS_COUNT: usize = SIZE_CLASSES.len();

/// A block handed out by [`PayloadArena::alloc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    offset: u32,
    len: u32,
    class: u8,
}

impl Span {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes reserved for this span
    pub fn block_size(&self) -> usize {
        SIZE_CLASSES[self.class as usize]
    }
}

fn class_for(len: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&size| size >= len)
}

pub struct PayloadArena {
    storage: Vec<u8>,
    /// Free block offsets per class; ordered so reuse favours low addresses
    free: [BTreeSet<u32>; CLASS_COUNT],
    in_use: usize,
    /// Size of the largest top-level block
    largest: usize,
}

impl PayloadArena {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        let mut free: [BTreeSet<u32>; CLASS_COUNT] = Default::default();
        let mut largest = 0;

        let mut offset = 0;
        while let Some(class) = (0..CLASS_COUNT).rev().find(|&c| SIZE_CLASSES[c] <= capacity - offset) {
            free[class].insert(offset as u32);
            largest = largest.max(SIZE_CLASSES[class]);
            offset += SIZE_CLASSES[class];
        }

        Self {
            storage: vec![0; capacity],
            free,
            in_use: 0,
            largest,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes held by live spans, counted by block size
    pub fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    /// Largest payload this arena can ever hold, zero if it has no blocks
    pub fn max_block(&self) -> usize {
        self.largest
    }

    /// Copy `bytes` into a fresh block
    ///
    /// Returns `None` if the payload is larger than [`MAX_PAYLOAD`] or no
    /// free block of its class or larger is available.
    pub fn alloc(&mut self, bytes: &[u8]) -> Option<Span> {
        let class = class_for(bytes.len())?;
        let source = (class..CLASS_COUNT).find(|&c| !self.free[c].is_empty())?;
        let offset = self.free[source].pop_first()?;

        // Split down, returning the upper halves to their classes
        for split in (class..source).rev() {
            self.free[split].insert(offset + SIZE_CLASSES[split] as u32);
        }

        let start = offset as usize;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.in_use += SIZE_CLASSES[class];

        Some(Span {
            offset,
            len: bytes.len() as u32,
            class: class as u8,
        })
    }

    pub fn free(&mut self, span: Span) {
        self.in_use -= span.block_size();

        let mut offset = span.offset;
        let mut class = span.class as usize;
        while class + 1 < CLASS_COUNT {
            let buddy = offset ^ SIZE_CLASSES[class] as u32;
            if !self.free[class].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            class += 1;
        }
        self.free[class].insert(offset);
    }

    pub fn get(&self, span: Span) -> &[u8] {
        let start = span.offset as usize;
        &self.storage[start..start + span.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(4096), Some(8));
        assert_eq!(class_for(4097), None);
    }

    #[test]
    fn test_alloc_and_get() {
        let mut arena = PayloadArena::new(1024);
        let a = arena.alloc(b"hello").unwrap();
        let b = arena.alloc(&[7u8; 40]).unwrap();

        assert_eq!(arena.get(a), b"hello");
        assert_eq!(arena.get(b), &[7u8; 40][..]);
        assert_eq!(a.block_size(), 16);
        assert_eq!(b.block_size(), 64);
        assert_eq!(arena.bytes_in_use(), 80);
    }

    #[test]
    fn test_free_block_is_reused() {
        let mut arena = PayloadArena::new(32);
        let a = arena.alloc(b"first").unwrap();
        let _b = arena.alloc(b"second").unwrap();
        assert!(arena.alloc(b"third").is_none());

        arena.free(a);
        let c = arena.alloc(b"third").unwrap();
        assert_eq!(arena.get(c), b"third");
        assert_eq!(arena.bytes_in_use(), 32);
    }

    #[test]
    fn test_freed_small_blocks_merge_for_larger_class() {
        let mut arena = PayloadArena::new(1024);
        let small: Vec<_> = (0..64).map(|i| arena.alloc(&[i as u8; 16]).unwrap()).collect();
        assert!(arena.alloc(&[0u8; 20]).is_none());

        for span in small {
            arena.free(span);
        }
        assert_eq!(arena.bytes_in_use(), 0);

        let big = arena.alloc(&[9u8; 1000]).unwrap();
        assert_eq!(big.block_size(), 1024);
        assert_eq!(arena.get(big), &[9u8; 1000][..]);
    }

    #[test]
    fn test_split_leaves_buddies_usable() {
        let mut arena = PayloadArena::new(256);
        let a = arena.alloc(&[1u8; 16]).unwrap();
        let b = arena.alloc(&[2u8; 100]).unwrap();
        let c = arena.alloc(&[3u8; 60]).unwrap();
        assert_eq!(arena.bytes_in_use(), 16 + 128 + 64);
        assert_eq!(arena.get(a), &[1u8; 16][..]);
        assert_eq!(arena.get(b), &[2u8; 100][..]);
        assert_eq!(arena.get(c), &[3u8; 60][..]);

        // 16 + 32 bytes left, never merged into a 128 block while a is live
        assert!(arena.alloc(&[0u8; 100]).is_none());
        arena.free(b);
        assert!(arena.alloc(&[0u8; 100]).is_some());
    }

    #[test]
    fn test_capacity_not_a_power_of_two() {
        let mut arena = PayloadArena::new(4096 + 512 + 48);
        assert_eq!(arena.max_block(), 4096);
        let spans: Vec<_> = [4096, 512, 32, 16]
            .iter()
            .map(|&len| arena.alloc(&vec![0u8; len]).unwrap())
            .collect();
        assert_eq!(arena.bytes_in_use(), 4096 + 512 + 48);
        assert!(arena.alloc(b"x").is_none());

        for span in spans {
            arena.free(span);
        }
        assert_eq!(PayloadArena::new(8).max_block(), 0);
    }

    #[test]
    fn test_oversized_payload() {
        let mut arena = PayloadArena::new(16 * 1024);
        assert!(arena.alloc(&vec![0u8; MAX_PAYLOAD + 1]).is_none());
        assert!(arena.alloc(&vec![0u8; MAX_PAYLOAD]).is_some());
    }
}
