//! Cache Module
//!
//! The store contract shared by every backend, the collaborators a store is
//! built with, and the on-heap implementations.

mod concurrent;
mod entry;
mod heap;
mod lru;
mod stats;
mod transaction;


use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::Result;
use crate::search::{IndexHandler, NoopIndexHandler, Query};

// Re-export public types
pub use concurrent::ConcurrentHeapCache;
pub use entry::CacheEntry;
pub use heap::HeapCache;
pub use lru::LruTracker;
pub use stats::{CacheStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionalCache};

// == Key and Value Bounds ==
/// Bounds every cache key satisfies.
pub trait CacheKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// Bounds every cached value satisfies.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

// == Cache Contract ==
/// Operations common to every store variant.
///
/// Absence is `Ok(None)`; errors are reserved for conditions the caller can act on.
pub trait Cache<K, V>: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Inserts or replaces an entry, evicting the least recently used entry on overflow.
    fn put(&self, key: K, value: V) -> Result<()>;

    /// Looks up a key, counting a hit or a miss; a miss consults the cache loader.
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Reads a key without touching statistics, recency or the loader.
    fn peek(&self, key: &K) -> Result<Option<V>>;

    /// Removes an entry and notifies the eviction listener if it existed.
    fn remove(&self, key: &K) -> Result<Option<V>>;

    /// Existence check without side effects.
    fn contains(&self, key: &K) -> bool;

    /// Removes every entry.
    fn clear(&self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    fn capacity(&self) -> usize;

    fn stats(&self) -> StatsSnapshot;

    /// hits / (hits + misses), 0.0 before the first lookup.
    fn hit_ratio(&self) -> f64 {
        self.stats().hit_rate()
    }

    /// Runs a query against the index handler and returns the matching values.
    fn execute(&self, query: &Query) -> Result<Vec<V>>;
}

/// Resolves the keys an index returns to the values currently stored.
///
/// Keys removed between the index lookup and the read are skipped, as are
/// values replaced meanwhile by one that no longer satisfies the query.
pub(crate) fn execute_query<K, V, C>(
    cache: &C,
    index: &dyn IndexHandler<K, V>,
    query: &Query,
) -> Result<Vec<V>>
where
    C: Cache<K, V> + ?Sized,
{
    let mut values = Vec::new();
    for key in index.execute(query)? {
        match cache.peek(&key)? {
            Some(value) if index.matches(&value, query) => values.push(value),
            _ => {}
        }
    }
    Ok(values)
}

// == Cache Loader ==
/// Produces a value for a key on a cache miss.
pub trait CacheLoader<K, V>: Send + Sync {
    fn load(&self, key: &K) -> Option<V>;
}

impl<K, V, F> CacheLoader<K, V> for F
where
    F: Fn(&K) -> Option<V> + Send + Sync,
{
    fn load(&self, key: &K) -> Option<V> {
        self(key)
    }
}

/// Loader that never resolves a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoader;

impl<K, V> CacheLoader<K, V> for NoopLoader {
    fn load(&self, _key: &K) -> Option<V> {
        None
    }
}

// == Eviction Listener ==
/// Notified after an entry has left a store.
pub trait EvictionListener<K, V>: Send + Sync {
    fn on_eviction(&self, key: &K, value: &V);
}

impl<K, V, F> EvictionListener<K, V> for F
where
    F: Fn(&K, &V) + Send + Sync,
{
    fn on_eviction(&self, key: &K, value: &V) {
        self(key, value)
    }
}

/// Listener that ignores evictions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<K, V> EvictionListener<K, V> for NoopListener {
    fn on_eviction(&self, _key: &K, _value: &V) {}
}

// == Cache Hooks ==
/// Collaborators a store calls into. `Default` is the no-op set.
pub struct CacheHooks<K, V> {
    pub loader: Arc<dyn CacheLoader<K, V>>,
    pub listener: Arc<dyn EvictionListener<K, V>>,
    pub index: Arc<dyn IndexHandler<K, V>>,
}

impl<K, V> CacheHooks<K, V> {
    pub fn with_loader(mut self, loader: impl CacheLoader<K, V> + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn with_listener(mut self, listener: impl EvictionListener<K, V> + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn IndexHandler<K, V>>) -> Self {
        self.index = index;
        self
    }
}

impl<K, V> Default for CacheHooks<K, V> {
    fn default() -> Self {
        Self {
            loader: Arc::new(NoopLoader),
            listener: Arc::new(NoopListener),
            index: Arc::new(NoopIndexHandler),
        }
    }
}

impl<K, V> Clone for CacheHooks<K, V> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            listener: Arc::clone(&self.listener),
            index: Arc::clone(&self.index),
        }
    }
}

impl<K, V> Debug for CacheHooks<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHooks").finish_non_exhaustive()
    }
}

// == Public Constants ==
/// Upper bound on segments picked automatically for a concurrent store.
pub const MAX_DEFAULT_SEGMENTS: usize = 64;
