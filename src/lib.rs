//! imcache - In-process object caching
//!
//! Capacity-bounded LRU stores (heap, concurrent heap, transactional, off-heap
//! and versioned off-heap) behind one contract, with miss-triggered loading,
//! eviction notification and secondary indexes queried by attribute.

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod offheap;
pub mod search;
pub mod serialization;
pub mod tasks;

pub use builder::CacheBuilder;
pub use cache::{
    Cache, CacheEntry, CacheHooks, CacheLoader, ConcurrentHeapCache, EvictionListener, HeapCache,
    StatsSnapshot, Transaction, TransactionalCache,
};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use offheap::{ArenaUsage, OffHeapCache, VersionedOffHeapCache};
pub use search::{AttributeValue, ConcurrentIndexHandler, IndexHandler, IndexType, Indexable, Query};
pub use serialization::{BytesSerializer, JsonSerializer, Serializer};
pub use tasks::{spawn_populator, CachePopulator, EntrySource, PopulateReport};
