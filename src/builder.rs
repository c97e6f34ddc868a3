//! Cache Builder
//!
//! Assembles any store variant from a [`CacheConfig`] plus the hooks it calls.

use std::sync::Arc;

use crate::cache::{
    CacheHooks, CacheKey, CacheLoader, CacheValue, ConcurrentHeapCache, EvictionListener,
    HeapCache, TransactionalCache,
};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::offheap::{OffHeapCache, VersionedOffHeapCache};
use crate::search::{ConcurrentIndexHandler, IndexHandler, IndexType, Indexable};
use crate::serialization::Serializer;

/// Builder for every store variant.
///
/// # Example
/// ```ignore
/// let cache = CacheBuilder::new(CacheConfig::from_env().with_name("users"))
///     .searchable()
///     .add_index("city", IndexType::NonUniqueHash)
///     .concurrent_heap()?;
/// ```
pub struct CacheBuilder<K, V> {
    config: CacheConfig,
    hooks: CacheHooks<K, V>,
    indexes: Vec<(String, IndexType)>,
}

impl<K: CacheKey, V: CacheValue> CacheBuilder<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            hooks: CacheHooks::default(),
            indexes: Vec::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn loader(mut self, loader: impl CacheLoader<K, V> + 'static) -> Self {
        self.hooks = self.hooks.with_loader(loader);
        self
    }

    pub fn listener(mut self, listener: impl EvictionListener<K, V> + 'static) -> Self {
        self.hooks = self.hooks.with_listener(listener);
        self
    }

    pub fn index_handler(mut self, handler: Arc<dyn IndexHandler<K, V>>) -> Self {
        self.hooks = self.hooks.with_index(handler);
        self
    }

    /// Installs a [`ConcurrentIndexHandler`] reading attributes through [`Indexable`].
    pub fn searchable(self) -> Self
    where
        V: Indexable,
    {
        self.index_handler(Arc::new(ConcurrentIndexHandler::<K, V>::new()))
    }

    /// Registers an index on whichever handler the built store ends up with.
    pub fn add_index(mut self, attribute: impl Into<String>, index_type: IndexType) -> Self {
        self.indexes.push((attribute.into(), index_type));
        self
    }

    fn finish(self) -> Result<(CacheConfig, CacheHooks<K, V>)> {
        self.config.validate()?;
        for (attribute, index_type) in &self.indexes {
            self.hooks.index.add_index(attribute, *index_type);
        }
        Ok((self.config, self.hooks))
    }

    // == Terminals ==
    /// Single-lock heap store with one global LRU order.
    pub fn heap(self) -> Result<HeapCache<K, V>> {
        let (config, hooks) = self.finish()?;
        HeapCache::new(config.name, config.capacity, hooks)
    }

    /// Heap store split into `config.segments` locks.
    pub fn concurrent_heap(self) -> Result<ConcurrentHeapCache<K, V>> {
        let (config, hooks) = self.finish()?;
        ConcurrentHeapCache::with_segments(config.name, config.capacity, config.segments, hooks)
    }

    /// Heap store wrapped for transactions; its listener hears commits once they finish.
    pub fn transactional_heap(self) -> Result<TransactionalCache<K, V, HeapCache<K, V>>> {
        let (config, hooks) = self.finish()?;
        TransactionalCache::new(hooks, |hooks| HeapCache::new(config.name, config.capacity, hooks))
    }

    pub fn off_heap(self, serializer: impl Serializer<V> + 'static) -> Result<OffHeapCache<K, V>> {
        let (config, hooks) = self.finish()?;
        OffHeapCache::new(
            config.name,
            config.capacity,
            config.arena_limit,
            Arc::new(serializer),
            hooks,
        )
    }

    pub fn versioned_off_heap(
        self,
        serializer: impl Serializer<V> + 'static,
    ) -> Result<VersionedOffHeapCache<K, V>> {
        let (config, hooks) = self.finish()?;
        VersionedOffHeapCache::new(
            config.name,
            config.capacity,
            config.arena_limit,
            config.read_retries,
            Arc::new(serializer),
            hooks,
        )
    }
}

impl<K: CacheKey, V: CacheValue> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::error::CacheError;
    use crate::search::Query;
    use crate::serialization::JsonSerializer;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig::default().with_name("built").with_capacity(capacity)
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = CacheBuilder::<u32, String>::new(config(0)).heap();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_heap_uses_config() {
        let cache = CacheBuilder::<u32, String>::new(config(3)).heap().unwrap();
        assert_eq!(cache.name(), "built");
        assert_eq!(cache.capacity(), 3);
    }

    #[test]
    fn test_builder_concurrent_heap_segments() {
        let cfg = CacheConfig {
            segments: 4,
            ..config(100)
        };
        let cache = CacheBuilder::<u32, u32>::new(cfg).concurrent_heap().unwrap();
        assert_eq!(cache.segment_count(), 4);
    }

    #[test]
    fn test_builder_searchable_registers_indexes() {
        let cache = CacheBuilder::<u32, Value>::new(config(10))
            .add_index("team", IndexType::NonUniqueHash)
            .searchable()
            .add_index("score", IndexType::Range)
            .heap()
            .unwrap();

        cache.put(1, json!({"team": "red", "score": 10})).unwrap();
        cache.put(2, json!({"team": "red", "score": 3})).unwrap();
        cache.put(3, json!({"team": "blue", "score": 7})).unwrap();

        let hits = cache
            .execute(&Query::eq("team", "red").and(Query::gt("score", 5)))
            .unwrap();
        assert_eq!(hits, vec![json!({"team": "red", "score": 10})]);
    }

    #[test]
    fn test_builder_without_index_rejects_queries() {
        let cache = CacheBuilder::<u32, Value>::new(config(10)).heap().unwrap();
        assert!(matches!(
            cache.execute(&Query::eq("team", "red")),
            Err(CacheError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_builder_wires_loader_and_listener() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        let cache = CacheBuilder::<u32, u32>::new(config(1))
            .loader(|key: &u32| Some(key * 2))
            .listener(move |_: &u32, _: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .off_heap(JsonSerializer::<u32>::new())
            .unwrap();

        assert_eq!(cache.get(&4).unwrap(), Some(8));
        assert_eq!(cache.get(&5).unwrap(), Some(10));
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builder_versioned_and_transactional() {
        let versioned = CacheBuilder::<String, Value>::new(config(4))
            .versioned_off_heap(JsonSerializer::<Value>::new())
            .unwrap();
        versioned.put("a".to_string(), json!([1, 2])).unwrap();
        assert_eq!(versioned.peek(&"a".to_string()).unwrap(), Some(json!([1, 2])));

        let transactional = CacheBuilder::<u32, String>::new(config(4))
            .transactional_heap()
            .unwrap();
        let mut tx = transactional.begin();
        tx.put(1, "one".to_string());
        tx.commit().unwrap();
        assert!(transactional.contains(&1));
    }
}
