//! Arena Allocator
//!
//! Hands out non-overlapping blocks of a byte arena and takes them back.
//! Free blocks are indexed twice: by offset for coalescing and by
//! `(size, offset)` for best-fit lookup.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::Serialize;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Every block size is a multiple of this.
pub const BLOCK_ALIGNMENT: usize = 8;

// == Block ==
/// Region `[offset, offset + size)` of an arena holding `len` payload bytes.
///
/// Not `Clone`: each block has a single owner and [`BlockAllocator::free`]
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    offset: usize,
    len: usize,
    size: usize,
}

impl Block {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserved size, the payload length rounded up to [`BLOCK_ALIGNMENT`].
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte range of the payload.
    pub fn payload(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

// == Arena Usage ==
/// Point-in-time view of an arena's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaUsage {
    /// Bytes reserved by live blocks
    pub used: usize,
    /// Bytes below the high-water mark sitting in the free pool
    pub free: usize,
    /// End of the furthest block ever kept
    pub high_water: usize,
    /// Maximum arena size in bytes
    pub limit: usize,
}

// == Block Allocator ==
#[derive(Debug)]
pub struct BlockAllocator {
    limit: usize,
    high_water: usize,
    used: usize,
    by_offset: BTreeMap<usize, usize>,
    by_size: BTreeSet<(usize, usize)>,
}

impl BlockAllocator {
    /// Creates an empty allocator that never grows past `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            high_water: 0,
            used: 0,
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
        }
    }

    /// Reserves a block for `len` payload bytes.
    ///
    /// The smallest free block that fits is reused and split when larger than
    /// needed; otherwise the arena grows at the high-water mark.
    pub fn allocate(&mut self, len: usize) -> Result<Block> {
        let size = aligned(len).ok_or_else(|| CacheError::CapacityExhausted {
            requested: len,
            available: self.largest_available(),
        })?;

        if let Some(&(free_size, offset)) = self.by_size.range((size, 0)..).next() {
            self.take_free(offset, free_size);
            if free_size > size {
                self.put_free(offset + size, free_size - size);
            }
            self.used += size;
            debug!(offset, size, free_size, "Reused free block");
            return Ok(Block { offset, len, size });
        }

        let available = self.limit - self.high_water;
        if size > available {
            return Err(CacheError::CapacityExhausted {
                requested: size,
                available: self.largest_available(),
            });
        }
        let offset = self.high_water;
        self.high_water += size;
        self.used += size;
        Ok(Block { offset, len, size })
    }

    /// Returns a block to the free pool, merging it with free neighbours.
    pub fn free(&mut self, block: Block) {
        let Block {
            mut offset,
            mut size,
            ..
        } = block;
        self.used -= size;

        let previous = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = previous {
            if prev_offset + prev_size == offset {
                self.take_free(prev_offset, prev_size);
                offset = prev_offset;
                size += prev_size;
            }
        }

        if let Some(&next_size) = self.by_offset.get(&(offset + size)) {
            self.take_free(offset + size, next_size);
            size += next_size;
        }

        if offset + size == self.high_water {
            self.high_water = offset;
        } else {
            self.put_free(offset, size);
        }
    }

    pub fn usage(&self) -> ArenaUsage {
        ArenaUsage {
            used: self.used,
            free: self.high_water - self.used,
            high_water: self.high_water,
            limit: self.limit,
        }
    }

    /// End of the highest live or pooled block.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Number of blocks in the free pool.
    pub fn free_blocks(&self) -> usize {
        self.by_offset.len()
    }

    fn largest_available(&self) -> usize {
        let largest_free = self.by_size.iter().next_back().map_or(0, |&(s, _)| s);
        largest_free.max(self.limit - self.high_water)
    }

    fn take_free(&mut self, offset: usize, size: usize) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    fn put_free(&mut self, offset: usize, size: usize) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }
}

/// Rounds a payload length up to a whole number of alignment units.
/// Empty payloads still reserve one unit so blocks never share an offset.
fn aligned(len: usize) -> Option<usize> {
    let units = len.max(1).checked_add(BLOCK_ALIGNMENT - 1)? / BLOCK_ALIGNMENT;
    units.checked_mul(BLOCK_ALIGNMENT)
}

// == Arena Memory ==
/// The bytes behind an allocator. Grows on demand, shrinks when the
/// allocator's high-water mark drops, never moves blocks.
#[derive(Debug, Default)]
pub struct ArenaMemory {
    bytes: Vec<u8>,
}

impl ArenaMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `data` into the block, which must have been sized for it.
    pub fn write(&mut self, block: &Block, data: &[u8]) {
        debug_assert_eq!(block.len(), data.len());
        let end = block.offset() + block.size();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[block.payload()].copy_from_slice(data);
    }

    /// Payload bytes at `offset`, or `None` outside anything ever written.
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.bytes.get(offset..offset.checked_add(len)?)
    }

    /// Drops bytes past `high_water`, handing memory back once at most half
    /// of the allocation is still in use.
    pub fn trim(&mut self, high_water: usize) {
        if high_water >= self.bytes.len() {
            return;
        }
        self.bytes.truncate(high_water);
        if self.bytes.capacity() > high_water.saturating_mul(2) {
            self.bytes.shrink_to_fit();
        }
    }

    /// Bytes currently backing the arena.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_aligned() {
        let mut arena = BlockAllocator::new(1024);
        let a = arena.allocate(1).unwrap();
        let b = arena.allocate(8).unwrap();
        let c = arena.allocate(9).unwrap();
        let empty = arena.allocate(0).unwrap();

        assert_eq!((a.offset(), a.size()), (0, 8));
        assert_eq!((b.offset(), b.size()), (8, 8));
        assert_eq!((c.offset(), c.size()), (16, 16));
        assert_eq!((empty.offset(), empty.size(), empty.len()), (32, 8, 0));
        assert_eq!(arena.usage().high_water, 40);
    }

    #[test]
    fn test_best_fit_reuse_and_split() {
        let mut arena = BlockAllocator::new(1024);
        let small = arena.allocate(16).unwrap();
        let _pin1 = arena.allocate(8).unwrap();
        let large = arena.allocate(64).unwrap();
        let _pin2 = arena.allocate(8).unwrap();
        let small_offset = small.offset();
        let large_offset = large.offset();
        arena.free(small);
        arena.free(large);

        // 10 bytes fit both holes; the 16-byte one is the best fit
        let reused = arena.allocate(10).unwrap();
        assert_eq!(reused.offset(), small_offset);

        // 24 bytes only fit the large hole, which is split
        let split = arena.allocate(24).unwrap();
        assert_eq!(split.offset(), large_offset);
        assert_eq!(arena.free_blocks(), 1);
        let usage = arena.usage();
        assert_eq!(usage.free, 40);
        assert_eq!(usage.used + usage.free, usage.high_water);
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let mut arena = BlockAllocator::new(1024);
        let a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        let c = arena.allocate(8).unwrap();
        let _tail = arena.allocate(8).unwrap();

        arena.free(a);
        arena.free(c);
        assert_eq!(arena.free_blocks(), 2);
        arena.free(b);
        assert_eq!(arena.free_blocks(), 1);

        let merged = arena.allocate(24).unwrap();
        assert_eq!(merged.offset(), 0);
        assert_eq!(arena.free_blocks(), 0);
    }

    #[test]
    fn test_free_at_end_lowers_high_water() {
        let mut arena = BlockAllocator::new(1024);
        let a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        let c = arena.allocate(8).unwrap();

        arena.free(b);
        arena.free(c);
        assert_eq!(arena.usage().high_water, 8);
        assert_eq!(arena.free_blocks(), 0);

        arena.free(a);
        assert_eq!(arena.usage(), ArenaUsage { used: 0, free: 0, high_water: 0, limit: 1024 });
    }

    #[test]
    fn test_limit_exhausted() {
        let mut arena = BlockAllocator::new(32);
        let a = arena.allocate(16).unwrap();
        let _b = arena.allocate(16).unwrap();

        let err = arena.allocate(1).unwrap_err();
        assert_eq!(err, CacheError::CapacityExhausted { requested: 8, available: 0 });

        arena.free(a);
        assert!(arena.allocate(16).is_ok());
        assert!(matches!(
            arena.allocate(usize::MAX),
            Err(CacheError::CapacityExhausted { .. })
        ));
    }

    #[test]
    fn test_memory_write_and_read() {
        let mut arena = BlockAllocator::new(1024);
        let mut memory = ArenaMemory::new();
        let first = arena.allocate(5).unwrap();
        let second = arena.allocate(3).unwrap();

        memory.write(&first, b"hello");
        memory.write(&second, b"abc");

        assert_eq!(memory.read(first.offset(), first.len()), Some(&b"hello"[..]));
        assert_eq!(memory.read(second.offset(), second.len()), Some(&b"abc"[..]));
        assert_eq!(memory.capacity(), 16);
        assert_eq!(memory.read(1000, 4), None);
    }

    #[test]
    fn test_memory_trims_to_high_water() {
        let mut arena = BlockAllocator::new(1 << 20);
        let mut memory = ArenaMemory::new();
        let kept = arena.allocate(8).unwrap();
        let large = arena.allocate(4096).unwrap();
        memory.write(&kept, b"kept0000");
        memory.write(&large, &[7; 4096]);
        assert_eq!(memory.capacity(), 8 + 4096);

        arena.free(large);
        memory.trim(arena.high_water());
        assert_eq!(memory.capacity(), 8);
        assert_eq!(memory.read(kept.offset(), kept.len()), Some(&b"kept0000"[..]));

        // trimming above the current length changes nothing
        memory.trim(64);
        assert_eq!(memory.capacity(), 8);
    }
}
