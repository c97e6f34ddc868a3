//! Concurrent Heap Store
//!
//! Partitions keys across independently locked segments so that operations
//! on different keys proceed in parallel, while operations on the same key
//! serialize on that key's segment lock.
//!
//! The entry count is shared across segments, so nothing is evicted until the
//! store as a whole is full. LRU order is kept per segment: an entry may be
//! evicted from one segment while another holds entries accessed less recently.

use std::thread;

use crate::cache::{
    Cache, CacheHooks, CacheKey, CacheValue, HeapCache, StatsSnapshot, MAX_DEFAULT_SEGMENTS,
};
use crate::error::Result;
use crate::search::Query;

// == Concurrent Heap Cache ==
/// Thread-safe heap store with segmented locking.
pub struct ConcurrentHeapCache<K, V> {
    inner: HeapCache<K, V>,
}

impl<K: CacheKey, V: CacheValue> ConcurrentHeapCache<K, V> {
    /// Creates a store with `min(cpus * 4, 64)` segments.
    pub fn new(name: impl Into<String>, capacity: usize, hooks: CacheHooks<K, V>) -> Result<Self> {
        Self::with_segments(name, capacity, default_segments(), hooks)
    }

    pub fn with_segments(
        name: impl Into<String>,
        capacity: usize,
        segments: usize,
        hooks: CacheHooks<K, V>,
    ) -> Result<Self> {
        Ok(Self {
            inner: HeapCache::with_segments(name, capacity, segments, hooks)?,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.inner.segment_count()
    }
}

fn default_segments() -> usize {
    let cpus = thread::available_parallelism().map_or(4, |n| n.get());
    (cpus * 4).min(MAX_DEFAULT_SEGMENTS)
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for ConcurrentHeapCache<K, V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        self.inner.put(key, value)
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        self.inner.get(key)
    }

    fn peek(&self, key: &K) -> Result<Option<V>> {
        self.inner.peek(key)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        self.inner.remove(key)
    }

    fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.stats()
    }

    fn execute(&self, query: &Query) -> Result<Vec<V>> {
        self.inner.execute(query)
    }
}
