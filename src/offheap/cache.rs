//! Off-Heap Store
//!
//! Keeps every value serialized in a managed byte arena. Live objects exist
//! only transiently while a call converts them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::cache::{
    execute_query, Cache, CacheHooks, CacheKey, CacheStats, CacheValue, LruTracker, StatsSnapshot,
};
use crate::error::{CacheError, Result};
use crate::offheap::{ArenaMemory, ArenaUsage, Block, BlockAllocator};
use crate::search::Query;
use crate::serialization::{serialization_error, Serializer};

// == Off-Heap State ==
/// Everything the store mutates, guarded by one lock.
struct OffHeapState<K> {
    allocator: BlockAllocator,
    memory: ArenaMemory,
    blocks: HashMap<K, Block>,
    lru: LruTracker<K>,
}

impl<K: CacheKey> OffHeapState<K> {
    fn copy_bytes(&self, block: &Block) -> Result<Vec<u8>> {
        self.memory
            .read(block.offset(), block.len())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| serialization_error("stored block", "outside the arena"))
    }
}

// == Off-Heap Cache ==
/// Capacity-bounded LRU store whose values live as bytes in an arena.
pub struct OffHeapCache<K, V> {
    name: String,
    capacity: usize,
    state: Mutex<OffHeapState<K>>,
    serializer: Arc<dyn Serializer<V>>,
    stats: CacheStats,
    hooks: CacheHooks<K, V>,
}

impl<K: CacheKey, V: CacheValue> OffHeapCache<K, V> {
    // == Constructor ==
    /// Creates a store of at most `capacity` entries in an arena of at most
    /// `arena_limit` bytes.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        arena_limit: usize,
        serializer: Arc<dyn Serializer<V>>,
        hooks: CacheHooks<K, V>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "capacity must be positive".to_string(),
            ));
        }
        if arena_limit == 0 {
            return Err(CacheError::InvalidConfig(
                "arena limit must be positive".to_string(),
            ));
        }

        let name = name.into();
        info!(cache = %name, capacity, arena_limit, "Off-heap cache created");

        Ok(Self {
            name,
            capacity,
            state: Mutex::new(OffHeapState {
                allocator: BlockAllocator::new(arena_limit),
                memory: ArenaMemory::new(),
                blocks: HashMap::new(),
                lru: LruTracker::new(),
            }),
            serializer,
            stats: CacheStats::new(),
            hooks,
        })
    }

    /// Current arena occupancy.
    pub fn arena_usage(&self) -> ArenaUsage {
        self.state.lock().allocator.usage()
    }

    /// Decodes a block that is leaving the store and returns it to the arena.
    ///
    /// A block that no longer decodes is still released; its value is lost
    /// to the index and the listener.
    fn release(&self, state: &mut OffHeapState<K>, key: &K, block: Block) -> Option<V> {
        let decoded = state
            .copy_bytes(&block)
            .and_then(|bytes| self.serializer.deserialize(&bytes));
        state.allocator.free(block);
        state.memory.trim(state.allocator.high_water());
        match decoded {
            Ok(value) => {
                self.hooks.index.remove(key, &value);
                Some(value)
            }
            Err(err) => {
                error!(cache = %self.name, key = ?key, error = %err, "Dropped undecodable block");
                None
            }
        }
    }

    /// Stores already serialized bytes for `value`.
    ///
    /// With `only_if_absent` an existing entry is kept and `Ok(false)` is
    /// returned. The allocation happens before anything else changes, so an
    /// exhausted arena leaves the store as it was. Returns the entry evicted
    /// for capacity alongside the outcome.
    fn store(
        &self,
        key: K,
        value: &V,
        bytes: &[u8],
        only_if_absent: bool,
    ) -> Result<(bool, Option<(K, V)>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let present = state.blocks.contains_key(&key);
        if present && only_if_absent {
            return Ok((false, None));
        }

        let block = state.allocator.allocate(bytes.len())?;
        state.memory.write(&block, bytes);

        let mut evicted = None;
        if !present && state.blocks.len() >= self.capacity {
            if let Some(oldest) = state.lru.evict_oldest() {
                if let Some(old_block) = state.blocks.remove(&oldest) {
                    self.stats.record_eviction();
                    debug!(cache = %self.name, key = ?oldest, "Evicted least recently used entry");
                    evicted = self
                        .release(state, &oldest, old_block)
                        .map(|value| (oldest, value));
                }
            }
        }

        if let Some(old_block) = state.blocks.insert(key.clone(), block) {
            // replacement is not an eviction, only the index hears about it
            self.release(state, &key, old_block);
        }
        self.hooks.index.add(&key, value);
        state.lru.touch(&key);
        Ok((true, evicted))
    }

    fn notify(&self, evicted: Option<(K, V)>) {
        if let Some((key, value)) = evicted {
            self.hooks.listener.on_eviction(&key, &value);
        }
    }

    /// Copies the stored bytes of `key`, refreshing recency when `touch` is set.
    fn read_bytes(&self, key: &K, touch: bool) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let bytes = match state.blocks.get(key) {
            Some(block) => state.copy_bytes(block)?,
            None => return Ok(None),
        };
        if touch {
            state.lru.touch(key);
        }
        Ok(Some(bytes))
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for OffHeapCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        // serialization failures surface before the store is touched
        let bytes = self.serializer.serialize(&value)?;
        let (_, evicted) = self.store(key, &value, &bytes, false)?;
        self.notify(evicted);
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        let stored = self
            .read_bytes(key, true)
            .and_then(|bytes| bytes.map(|b| self.serializer.deserialize(&b)).transpose());
        match stored {
            Ok(Some(value)) => {
                self.stats.record_hit();
                return Ok(Some(value));
            }
            Ok(None) => self.stats.record_miss(),
            Err(err) => {
                self.stats.record_miss();
                return Err(err);
            }
        }

        let loaded = match self.hooks.loader.load(key) {
            Some(value) => value,
            None => return Ok(None),
        };
        let bytes = self.serializer.serialize(&loaded)?;
        let (stored, evicted) = self.store(key.clone(), &loaded, &bytes, true)?;
        self.notify(evicted);
        if stored {
            return Ok(Some(loaded));
        }
        // filled by another caller while the loader ran
        Ok(self.peek(key)?.or(Some(loaded)))
    }

    fn peek(&self, key: &K) -> Result<Option<V>> {
        self.read_bytes(key, false)?
            .map(|bytes| self.serializer.deserialize(&bytes))
            .transpose()
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        let removed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.blocks.remove(key) {
                Some(block) => {
                    state.lru.remove(key);
                    Some(self.release(state, key, block))
                }
                None => None,
            }
        };

        match removed {
            Some(Some(value)) => {
                self.hooks.listener.on_eviction(key, &value);
                Ok(Some(value))
            }
            Some(None) => Err(serialization_error(
                "removed block",
                "stored bytes could not be decoded",
            )),
            None => Ok(None),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.state.lock().blocks.contains_key(key)
    }

    fn clear(&self) -> Result<()> {
        let removed: Vec<(K, V)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.lru.clear();
            let drained: Vec<(K, Block)> = state.blocks.drain().collect();
            let removed = drained
                .into_iter()
                .filter_map(|(key, block)| {
                    self.release(state, &key, block).map(|value| (key, value))
                })
                .collect();
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
        self.state.lock().blocks.len()
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
