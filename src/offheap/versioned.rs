//! Versioned Off-Heap Store
//!
//! Off-heap store whose readers copy bytes without holding the metadata lock.
//! Every write is stamped with a version from a monotonic counter; a reader
//! captures `(block, version)`, copies the payload, then re-checks that the
//! entry still carries that version. A changed version means the block may
//! have been freed and reused mid-copy, so the read is retried.
//!
//! Writers follow the same split: they reserve a block and a version under
//! the metadata lock, copy their payload holding only the byte lock, and
//! publish under the metadata lock. A write whose version is older than the
//! one already published is dropped, so the last writer by version wins.
//!
//! Lock order is metadata then bytes; nothing acquires them the other way.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::{
    execute_query, Cache, CacheHooks, CacheKey, CacheStats, CacheValue, LruTracker, StatsSnapshot,
};
use crate::error::{CacheError, Result};
use crate::offheap::{ArenaMemory, ArenaUsage, Block, BlockAllocator};
use crate::search::Query;
use crate::serialization::{serialization_error, Serializer};

#[derive(Debug)]
struct VersionedBlock {
    block: Block,
    version: u64,
}

struct VersionedState<K> {
    allocator: BlockAllocator,
    entries: HashMap<K, VersionedBlock>,
    lru: LruTracker<K>,
    next_version: u64,
}

/// A block reserved for a write that has not been published yet.
struct Reservation {
    block: Block,
    version: u64,
}

/// Result of publishing a reservation.
enum Published<K, V> {
    Stored { evicted: Option<(K, V)> },
    /// A newer version was already in place
    Superseded,
    /// `only_if_absent` found an entry
    Occupied,
}

// == Versioned Off-Heap Cache ==
pub struct VersionedOffHeapCache<K, V> {
    name: String,
    capacity: usize,
    read_retries: u32,
    state: Mutex<VersionedState<K>>,
    memory: RwLock<ArenaMemory>,
    serializer: Arc<dyn Serializer<V>>,
    stats: CacheStats,
    hooks: CacheHooks<K, V>,
    /// Runs between a read's copy and its version re-check.
    #[cfg(test)]
    interleave: Option<Box<dyn Fn(&VersionedOffHeapCache<K, V>) + Send + Sync>>,
}

impl<K: CacheKey, V: CacheValue> VersionedOffHeapCache<K, V> {
    // == Constructor ==
    /// Creates a store of at most `capacity` entries in an arena of at most
    /// `arena_limit` bytes. A read gives up after `read_retries` attempts
    /// that each saw the entry change underneath it.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        arena_limit: usize,
        read_retries: u32,
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
        if read_retries == 0 {
            return Err(CacheError::InvalidConfig(
                "read retries must be positive".to_string(),
            ));
        }

        let name = name.into();
        info!(
            cache = %name,
            capacity,
            arena_limit,
            read_retries,
            "Versioned off-heap cache created"
        );

        Ok(Self {
            name,
            capacity,
            read_retries,
            state: Mutex::new(VersionedState {
                allocator: BlockAllocator::new(arena_limit),
                entries: HashMap::new(),
                lru: LruTracker::new(),
                next_version: 1,
            }),
            memory: RwLock::new(ArenaMemory::new()),
            serializer,
            stats: CacheStats::new(),
            hooks,
            #[cfg(test)]
            interleave: None,
        })
    }

    /// Current arena occupancy.
    pub fn arena_usage(&self) -> ArenaUsage {
        self.state.lock().allocator.usage()
    }

    /// Version of the entry currently published for `key`.
    pub fn version_of(&self, key: &K) -> Option<u64> {
        self.state.lock().entries.get(key).map(|e| e.version)
    }

    // == Write Path ==
    fn reserve(&self, len: usize) -> Result<Reservation> {
        let mut state = self.state.lock();
        let block = state.allocator.allocate(len)?;
        let version = state.next_version;
        state.next_version += 1;
        Ok(Reservation { block, version })
    }

    fn write_payload(&self, reservation: &Reservation, bytes: &[u8]) {
        self.memory.write().write(&reservation.block, bytes);
    }

    fn publish(
        &self,
        key: K,
        value: &V,
        reservation: Reservation,
        only_if_absent: bool,
    ) -> Published<K, V> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Reservation { block, version } = reservation;

        let current = state.entries.get(&key).map(|e| e.version);
        match current {
            Some(_) if only_if_absent => {
                state.allocator.free(block);
                return Published::Occupied;
            }
            Some(published) if published > version => {
                state.allocator.free(block);
                debug!(
                    cache = %self.name,
                    key = ?key,
                    version,
                    published,
                    "Dropped superseded write"
                );
                return Published::Superseded;
            }
            _ => {}
        }

        let mut evicted = None;
        if current.is_none() && state.entries.len() >= self.capacity {
            if let Some(oldest) = state.lru.evict_oldest() {
                if let Some(entry) = state.entries.remove(&oldest) {
                    self.stats.record_eviction();
                    debug!(cache = %self.name, key = ?oldest, "Evicted least recently used entry");
                    evicted = self
                        .release(state, &oldest, entry.block)
                        .map(|value| (oldest, value));
                }
            }
        }

        if let Some(old) = state.entries.insert(key.clone(), VersionedBlock { block, version }) {
            self.release(state, &key, old.block);
        }
        self.hooks.index.add(&key, value);
        state.lru.touch(&key);
        Published::Stored { evicted }
    }

    /// Serializes, reserves, copies and publishes one write.
    fn write_entry(&self, key: K, value: &V, only_if_absent: bool) -> Result<Published<K, V>> {
        let bytes = self.serializer.serialize(value)?;
        let reservation = self.reserve(bytes.len())?;
        self.write_payload(&reservation, &bytes);
        Ok(self.publish(key, value, reservation, only_if_absent))
    }

    /// Decodes a block leaving the store, frees it and drops it from the index.
    /// Called with the metadata lock held.
    fn release(&self, state: &mut VersionedState<K>, key: &K, block: Block) -> Option<V> {
        let decoded = {
            let memory = self.memory.read();
            match memory.read(block.offset(), block.len()) {
                Some(bytes) => self.serializer.deserialize(bytes),
                None => Err(serialization_error("stored block", "outside the arena")),
            }
        };
        state.allocator.free(block);
        let high_water = state.allocator.high_water();
        let oversized = self.memory.read().capacity() > high_water;
        if oversized {
            self.memory.write().trim(high_water);
        }
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

    fn notify(&self, evicted: Option<(K, V)>) {
        if let Some((key, value)) = evicted {
            self.hooks.listener.on_eviction(&key, &value);
        }
    }

    // == Read Path ==
    /// Reads a consistent copy of `key`'s value.
    fn read_entry(&self, key: &K, touch: bool) -> Result<Option<V>> {
        for _ in 0..self.read_retries {
            let (offset, len, version) = match self.state.lock().entries.get(key) {
                Some(entry) => (entry.block.offset(), entry.block.len(), entry.version),
                None => return Ok(None),
            };

            let bytes = self.memory.read().read(offset, len).map(<[u8]>::to_vec);
            self.after_copy();

            let stable = {
                let mut state = self.state.lock();
                let stable = state.entries.get(key).map(|e| e.version) == Some(version);
                if stable && touch {
                    state.lru.touch(key);
                }
                stable
            };
            if let (true, Some(bytes)) = (stable, bytes) {
                return self.serializer.deserialize(&bytes).map(Some);
            }
        }

        warn!(
            cache = %self.name,
            key = ?key,
            attempts = self.read_retries,
            "Read never saw a stable version"
        );
        Err(CacheError::RetryExhausted {
            attempts: self.read_retries,
        })
    }

    #[cfg(test)]
    fn after_copy(&self) {
        if let Some(interleave) = &self.interleave {
            interleave(self);
        }
    }

    #[cfg(not(test))]
    fn after_copy(&self) {}
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for VersionedOffHeapCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        if let Published::Stored { evicted } = self.write_entry(key, &value, false)? {
            self.notify(evicted);
        }
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        match self.read_entry(key, true) {
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
        match self.write_entry(key.clone(), &loaded, true)? {
            Published::Stored { evicted } => {
                self.notify(evicted);
                Ok(Some(loaded))
            }
            // filled by another caller while the loader ran
            Published::Occupied | Published::Superseded => {
                Ok(self.read_entry(key, false)?.or(Some(loaded)))
            }
        }
    }

    fn peek(&self, key: &K) -> Result<Option<V>> {
        self.read_entry(key, false)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        let removed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.entries.remove(key) {
                Some(entry) => {
                    state.lru.remove(key);
                    Some(self.release(state, key, entry.block))
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
        self.state.lock().entries.contains_key(key)
    }

    fn clear(&self) -> Result<()> {
        let removed: Vec<(K, V)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.lru.clear();
            let drained: Vec<(K, VersionedBlock)> = state.entries.drain().collect();
            let removed = drained
                .into_iter()
                .filter_map(|(key, entry)| {
                    self.release(state, &key, entry.block)
                        .map(|value| (key, value))
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
        self.state.lock().entries.len()
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
