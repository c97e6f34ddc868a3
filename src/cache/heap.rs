//! Heap Store Module
//!
//! Capacity-bounded store keeping values as live objects, with LRU eviction,
//! miss-triggered loading and index maintenance.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::cache::{
    execute_query, Cache, CacheHooks, CacheKey, CacheStats, CacheValue, LruTracker, StatsSnapshot,
};
use crate::error::{CacheError, Result};
use crate::search::Query;

// == Heap Segment ==
/// One independently locked partition of a heap store.
#[derive(Debug)]
struct HeapSegment<K, V> {
    entries: HashMap<K, V>,
    lru: LruTracker<K>,
}

impl<K: CacheKey, V> HeapSegment<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
        }
    }

    /// Returns the value and marks the key most recently used.
    fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.lru.touch(key);
        }
        self.entries.get(key)
    }

    fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Inserts or replaces a value and returns the replaced one.
    fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.lru.touch(&key);
        self.entries.insert(key, value)
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let oldest = self.lru.evict_oldest()?;
        self.entries.remove(&oldest).map(|value| (oldest, value))
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.lru.remove(key);
        Some(value)
    }

    fn drain(&mut self) -> Vec<(K, V)> {
        self.lru.clear();
        self.entries.drain().collect()
    }
}

/// Outcome of placing an entry in a segment.
enum Placement<K, V> {
    /// Stored, possibly after evicting the segment's own oldest entry.
    Stored(Option<(K, V)>),
    /// The store is full and the segment has nothing of its own to evict.
    Full(K, V),
}

// == Heap Cache ==
/// Heap store with one global LRU order.
///
/// With more than one segment, as in
/// [`ConcurrentHeapCache`](crate::cache::ConcurrentHeapCache), keys spread over
/// independently locked segments. The entry count is shared,
/// so eviction starts only once the whole store is full; the victim is the
/// oldest entry of the inserting segment, or of the next non-empty one when
/// that segment holds nothing.
pub struct HeapCache<K, V> {
    name: String,
    capacity: usize,
    len: AtomicUsize,
    segments: Box<[Mutex<HeapSegment<K, V>>]>,
    hasher: RandomState,
    stats: CacheStats,
    hooks: CacheHooks<K, V>,
}

impl<K: CacheKey, V: CacheValue> HeapCache<K, V> {
    // == Constructor ==
    /// Creates a heap store holding at most `capacity` entries.
    pub fn new(name: impl Into<String>, capacity: usize, hooks: CacheHooks<K, V>) -> Result<Self> {
        Self::with_segments(name, capacity, 1, hooks)
    }

    /// Creates a heap store partitioned into `segments` locks.
    ///
    /// The segment count is lowered to `capacity` when larger.
    pub fn with_segments(
        name: impl Into<String>,
        capacity: usize,
        segments: usize,
        hooks: CacheHooks<K, V>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "capacity must be positive".to_string(),
            ));
        }
        if segments == 0 {
            return Err(CacheError::InvalidConfig(
                "segments must be positive".to_string(),
            ));
        }

        let count = segments.min(capacity);
        let segments: Box<[_]> = (0..count).map(|_| Mutex::new(HeapSegment::new())).collect();

        let name = name.into();
        info!(cache = %name, capacity, segments = count, "Heap cache created");

        Ok(Self {
            name,
            capacity,
            len: AtomicUsize::new(0),
            segments,
            hasher: RandomState::new(),
            stats: CacheStats::new(),
            hooks,
        })
    }

    /// Number of lock segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn slot(&self, key: &K) -> usize {
        if self.segments.len() == 1 {
            0
        } else {
            (self.hasher.hash_one(key) % self.segments.len() as u64) as usize
        }
    }

    fn segment(&self, key: &K) -> MutexGuard<'_, HeapSegment<K, V>> {
        self.segments[self.slot(key)].lock()
    }

    /// Claims room for one more entry if the store is below capacity.
    fn reserve_slot(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    fn record_evicted(&self, key: &K, value: &V) {
        self.hooks.index.remove(key, value);
        self.stats.record_eviction();
        debug!(cache = %self.name, key = ?key, "Evicted least recently used entry");
    }

    /// Places an entry under an already held segment lock and keeps the index
    /// in step.
    ///
    /// A new key claims a free slot, or else evicts the segment's oldest
    /// entry. The evicted entry's listener call is left to the caller once the
    /// lock is released.
    fn place_locked(&self, segment: &mut HeapSegment<K, V>, key: K, value: V) -> Placement<K, V> {
        let mut evicted = None;
        if segment.peek(&key).is_none() && !self.reserve_slot() {
            match segment.evict_oldest() {
                Some(entry) => evicted = Some(entry),
                None => return Placement::Full(key, value),
            }
        }
        if let Some((evicted_key, evicted_value)) = &evicted {
            self.record_evicted(evicted_key, evicted_value);
        }

        let index = &self.hooks.index;
        if let Some(old) = segment.insert(key.clone(), value) {
            index.remove(&key, &old);
        }
        if let Some(current) = segment.peek(&key) {
            index.add(&key, current);
        }
        Placement::Stored(evicted)
    }

    /// Evicts the oldest entry of the first non-empty segment after `from`.
    fn evict_elsewhere(&self, from: usize) -> Option<(K, V)> {
        let count = self.segments.len();
        for step in 1..=count {
            let mut segment = self.segments[(from + step) % count].lock();
            if let Some((key, value)) = segment.evict_oldest() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.record_evicted(&key, &value);
                return Some((key, value));
            }
        }
        None
    }

    /// Stores an entry. With `only_if_absent` an existing value is kept and
    /// returned instead.
    fn store(&self, mut key: K, mut value: V, only_if_absent: bool) -> Option<V> {
        loop {
            let slot = self.slot(&key);
            let placement = {
                let mut segment = self.segments[slot].lock();
                if only_if_absent {
                    if let Some(existing) = segment.peek(&key) {
                        return Some(existing.clone());
                    }
                }
                self.place_locked(&mut segment, key, value)
            };
            match placement {
                Placement::Stored(evicted) => {
                    self.notify(evicted);
                    return None;
                }
                Placement::Full(k, v) => {
                    match self.evict_elsewhere(slot) {
                        Some(evicted) => self.notify(Some(evicted)),
                        // entries moved while the segments were scanned
                        None => thread::yield_now(),
                    }
                    key = k;
                    value = v;
                }
            }
        }
    }

    fn notify(&self, evicted: Option<(K, V)>) {
        if let Some((key, value)) = evicted {
            self.hooks.listener.on_eviction(&key, &value);
        }
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for HeapCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        self.store(key, value, false);
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.segment(key).get(key) {
            self.stats.record_hit();
            return Ok(Some(value.clone()));
        }
        self.stats.record_miss();

        // the loader runs without the segment lock so it may call back into the cache
        let loaded = match self.hooks.loader.load(key) {
            Some(value) => value,
            None => return Ok(None),
        };

        // filled by another caller while the loader ran
        let existing = self.store(key.clone(), loaded.clone(), true);
        Ok(Some(existing.unwrap_or(loaded)))
    }

    fn peek(&self, key: &K) -> Result<Option<V>> {
        Ok(self.segment(key).peek(key).cloned())
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        let removed = {
            let mut segment = self.segment(key);
            let removed = segment.remove(key);
            if let Some(value) = &removed {
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.hooks.index.remove(key, value);
            }
            removed
        };
        if let Some(value) = &removed {
            self.hooks.listener.on_eviction(key, value);
        }
        Ok(removed)
    }

    fn contains(&self, key: &K) -> bool {
        self.segment(key).peek(key).is_some()
    }

    fn clear(&self) -> Result<()> {
        let removed: Vec<(K, V)> = {
            let mut guards: Vec<_> = self.segments.iter().map(|s| s.lock()).collect();
            let removed: Vec<(K, V)> = guards.iter_mut().flat_map(|g| g.drain()).collect();
            self.len.fetch_sub(removed.len(), Ordering::AcqRel);
            for (key, value) in &removed {
                self.hooks.index.remove(key, value);
            }
            self.hooks.index.clear();
            removed
        };
        debug!(cache = %self.name, removed = removed.len(), "Cache cleared");
        for (key, value) in &removed {
            self.hooks.listener.on_eviction(key, value);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.len())
    }

    fn execute(&self, query: &Query) -> Result<Vec<V>> {
        execute_query(self, self.hooks.index.as_ref(), query)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ConcurrentIndexHandler, IndexHandler, IndexType};
    use std::sync::Arc;

    type Evictions = Arc<parking_lot::Mutex<Vec<(u32, String)>>>;

    fn recording_hooks() -> (CacheHooks<u32, String>, Evictions) {
        let evictions: Evictions = Arc::default();
        let sink = Arc::clone(&evictions);
        let hooks = CacheHooks::default().with_listener(move |k: &u32, v: &String| {
            sink.lock().push((*k, v.clone()));
        });
        (hooks, evictions)
    }

    #[test]
    fn test_heap_new() {
        let cache: HeapCache<u32, String> = HeapCache::new("t", 10, CacheHooks::default()).unwrap();
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 10);
        assert_eq!(cache.name(), "t");
    }

    #[test]
    fn test_heap_zero_capacity_rejected() {
        let result: Result<HeapCache<u32, String>> = HeapCache::new("t", 0, CacheHooks::default());
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_heap_put_and_get() {
        let cache = HeapCache::new("t", 10, CacheHooks::default()).unwrap();
        cache.put(1u32, "one".to_string()).unwrap();

        assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_heap_lru_scenario() {
        // capacity 2: put 1, put 2, get 1, put 3 -> 2 is evicted
        let (hooks, evictions) = recording_hooks();
        let cache = HeapCache::new("t", 2, hooks).unwrap();

        cache.put(1, "a".to_string()).unwrap();
        cache.put(2, "b".to_string()).unwrap();
        cache.get(&1).unwrap();
        cache.put(3, "c".to_string()).unwrap();

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(*evictions.lock(), vec![(2, "b".to_string())]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_heap_put_refreshes_recency() {
        let cache = HeapCache::new("t", 2, CacheHooks::default()).unwrap();
        cache.put(1u32, "a".to_string()).unwrap();
        cache.put(2, "b".to_string()).unwrap();
        cache.put(1, "a2".to_string()).unwrap();
        cache.put(3, "c".to_string()).unwrap();

        assert_eq!(cache.peek(&1).unwrap(), Some("a2".to_string()));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn test_heap_overwrite_does_not_notify() {
        let (hooks, evictions) = recording_hooks();
        let cache = HeapCache::new("t", 2, hooks).unwrap();
        cache.put(1, "a".to_string()).unwrap();
        cache.put(1, "b".to_string()).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(evictions.lock().is_empty());
    }

    #[test]
    fn test_heap_remove_twice() {
        let (hooks, evictions) = recording_hooks();
        let cache = HeapCache::new("t", 4, hooks).unwrap();
        cache.put(1, "a".to_string()).unwrap();

        assert_eq!(cache.remove(&1).unwrap(), Some("a".to_string()));
        assert_eq!(cache.remove(&1).unwrap(), None);
        assert_eq!(evictions.lock().len(), 1);
    }

    #[test]
    fn test_heap_miss_without_loader() {
        let cache: HeapCache<u32, String> = HeapCache::new("t", 4, CacheHooks::default()).unwrap();

        assert_eq!(cache.get(&9).unwrap(), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_heap_loader_fills_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hooks = CacheHooks::default().with_loader(move |key: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            (*key < 100).then(|| format!("loaded-{}", key))
        });
        let cache = HeapCache::new("t", 4, hooks).unwrap();

        assert_eq!(cache.get(&7).unwrap(), Some("loaded-7".to_string()));
        assert!(cache.contains(&7));
        // second read is a hit, loader not called again
        assert_eq!(cache.get(&7).unwrap(), Some("loaded-7".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // loader absence stores nothing
        assert_eq!(cache.get(&500).unwrap(), None);
        assert!(!cache.contains(&500));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_heap_loader_may_reenter_cache() {
        type Shared = HeapCache<u32, String>;
        let cache: Arc<Shared> = Arc::new_cyclic(|weak: &std::sync::Weak<Shared>| {
            let weak = weak.clone();
            let hooks = CacheHooks::default().with_loader(move |key: &u32| {
                let cache = weak.upgrade()?;
                // reading another key from inside the loader must not deadlock
                cache.peek(&(key + 1)).ok().flatten()
            });
            HeapCache::new("t", 4, hooks).unwrap()
        });
        cache.put(2, "two".to_string()).unwrap();

        assert_eq!(cache.get(&1).unwrap(), Some("two".to_string()));
    }

    #[test]
    fn test_heap_contains_has_no_side_effects() {
        let cache = HeapCache::new("t", 2, CacheHooks::default()).unwrap();
        cache.put(1u32, "a".to_string()).unwrap();
        cache.put(2, "b".to_string()).unwrap();

        assert!(cache.contains(&1));
        cache.put(3, "c".to_string()).unwrap();

        // contains did not refresh key 1
        assert!(!cache.contains(&1));
        assert_eq!(cache.stats().requests(), 0);
    }

    #[test]
    fn test_heap_clear_notifies_every_entry() {
        let (hooks, evictions) = recording_hooks();
        let cache = HeapCache::new("t", 8, hooks).unwrap();
        for i in 0..5 {
            cache.put(i, i.to_string()).unwrap();
        }
        cache.clear().unwrap();

        assert!(cache.is_empty());
        assert_eq!(evictions.lock().len(), 5);
    }

    #[test]
    fn test_heap_hit_ratio() {
        let cache = HeapCache::new("t", 8, CacheHooks::default()).unwrap();
        assert_eq!(cache.hit_ratio(), 0.0);

        cache.put(1u32, "a".to_string()).unwrap();
        cache.get(&1).unwrap();
        cache.get(&2).unwrap();
        cache.get(&3).unwrap();

        assert!((cache.hit_ratio() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_heap_index_follows_replacement_and_eviction() {
        let index = Arc::new(ConcurrentIndexHandler::<u32, serde_json::Value>::new());
        index.add_index("city", IndexType::NonUniqueHash);
        let hooks = CacheHooks::default().with_index(index.clone());
        let cache = HeapCache::new("t", 2, hooks).unwrap();

        cache.put(1, serde_json::json!({"city": "Paris"})).unwrap();
        cache.put(1, serde_json::json!({"city": "Lyon"})).unwrap();
        assert!(cache.execute(&Query::eq("city", "Paris")).unwrap().is_empty());
        assert_eq!(cache.execute(&Query::eq("city", "Lyon")).unwrap().len(), 1);

        cache.put(2, serde_json::json!({"city": "Lyon"})).unwrap();
        cache.put(3, serde_json::json!({"city": "Nice"})).unwrap();

        // key 1 was evicted and left the index
        assert_eq!(index.execute(&Query::eq("city", "Lyon")).unwrap(), vec![2]);
    }

    #[test]
    fn test_heap_query_skips_values_that_no_longer_match() {
        let index = Arc::new(ConcurrentIndexHandler::<u32, serde_json::Value>::new());
        index.add_index("city", IndexType::NonUniqueHash);
        let hooks = CacheHooks::default().with_index(index.clone());
        let cache = HeapCache::new("t", 4, hooks).unwrap();
        cache.put(1, serde_json::json!({"city": "Lyon"})).unwrap();

        // index still lists key 1 under a value the store no longer holds
        index.add(&1, &serde_json::json!({"city": "Paris"}));

        assert_eq!(index.execute(&Query::eq("city", "Paris")).unwrap(), vec![1]);
        assert!(cache.execute(&Query::eq("city", "Paris")).unwrap().is_empty());
    }

    #[test]
    fn test_heap_unique_index_survives_later_owner_removal() {
        let index = Arc::new(ConcurrentIndexHandler::<u32, serde_json::Value>::new());
        index.add_index("email", IndexType::UniqueHash);
        let hooks = CacheHooks::default().with_index(index.clone());
        let cache = HeapCache::new("t", 4, hooks).unwrap();

        cache.put(1, serde_json::json!({"email": "a@x"})).unwrap();
        cache.put(2, serde_json::json!({"email": "a@x"})).unwrap();
        cache.remove(&2).unwrap();

        assert_eq!(
            cache.execute(&Query::eq("email", "a@x")).unwrap(),
            vec![serde_json::json!({"email": "a@x"})]
        );
        assert_eq!(index.execute(&Query::eq("email", "a@x")).unwrap(), vec![1]);
    }

    #[test]
    fn test_heap_segments_fill_to_capacity_before_evicting() {
        let (hooks, evictions) = recording_hooks();
        let cache = HeapCache::with_segments("t", 8, 8, hooks).unwrap();
        assert_eq!(cache.segment_count(), 8);

        for i in 0..8u32 {
            cache.put(i, i.to_string()).unwrap();
        }
        assert_eq!(cache.len(), 8);
        assert!(evictions.lock().is_empty());
        assert_eq!(cache.stats().evictions, 0);

        cache.put(100, "extra".to_string()).unwrap();
        assert_eq!(cache.len(), 8);
        assert_eq!(evictions.lock().len(), 1);
        assert!(cache.contains(&100));

        let small: HeapCache<u32, u32> =
            HeapCache::with_segments("t", 3, 16, CacheHooks::default()).unwrap();
        assert_eq!(small.segment_count(), 3);
    }
}
