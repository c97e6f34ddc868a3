//! Off-Heap Module
//!
//! Stores that keep values as serialized bytes in a managed arena instead of
//! as live objects.
//!
//! # Components
//! - `BlockAllocator`: best-fit block allocation with splitting and coalescing
//! - `ArenaMemory`: the bytes blocks point into
//! - `OffHeapCache`: single-lock off-heap store
//! - `VersionedOffHeapCache`: optimistic reads validated by per-entry versions

mod arena;
mod cache;
mod versioned;

// Re-export public types
pub use arena::{ArenaMemory, ArenaUsage, Block, BlockAllocator, BLOCK_ALIGNMENT};
pub use cache::OffHeapCache;
pub use versioned::VersionedOffHeapCache;
