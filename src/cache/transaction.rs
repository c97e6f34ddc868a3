//! Transactional Store
//!
//! Wraps any store with begin/commit/rollback. Staged mutations stay private
//! to the transaction until commit; rollback discards them without touching
//! the wrapped store, its index or its listener.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::{Cache, CacheHooks, CacheKey, CacheValue, EvictionListener, StatsSnapshot};
use crate::error::{CacheError, Result};
use crate::search::Query;

#[derive(Debug, Clone)]
enum Staged<V> {
    Put(V),
    Remove,
}

// == Commit Listener ==
/// Eviction listener installed in the wrapped store.
///
/// While a commit runs, notifications raised on the committing thread are
/// held back and handed to the commit; everything else passes straight through.
struct CommitListener<K, V> {
    target: Arc<dyn EvictionListener<K, V>>,
    held: Mutex<Option<(ThreadId, Vec<(K, V)>)>>,
}

impl<K, V> CommitListener<K, V> {
    fn new(target: Arc<dyn EvictionListener<K, V>>) -> Self {
        Self {
            target,
            held: Mutex::new(None),
        }
    }

    fn hold(&self) {
        *self.held.lock() = Some((thread::current().id(), Vec::new()));
    }

    /// Stops holding and returns what was held.
    fn release(&self) -> Vec<(K, V)> {
        self.held.lock().take().map(|(_, events)| events).unwrap_or_default()
    }

    /// Returns what was held so far and keeps holding.
    fn drain(&self) -> Vec<(K, V)> {
        self.held
            .lock()
            .as_mut()
            .map(|(_, events)| std::mem::take(events))
            .unwrap_or_default()
    }

    fn deliver(&self, events: &[(K, V)]) {
        for (key, value) in events {
            self.target.on_eviction(key, value);
        }
    }
}

impl<K: CacheKey, V: CacheValue> EvictionListener<K, V> for CommitListener<K, V> {
    fn on_eviction(&self, key: &K, value: &V) {
        {
            let mut held = self.held.lock();
            if let Some((committer, events)) = held.as_mut() {
                if *committer == thread::current().id() {
                    events.push((key.clone(), value.clone()));
                    return;
                }
            }
        }
        self.target.on_eviction(key, value);
    }
}

// == Transactional Cache ==
/// Store wrapper whose mutations can be grouped into transactions.
///
/// Operations issued directly on the wrapper behave like the wrapped store.
/// A commit holds the wrapper's write gate while it applies staged work, so
/// callers going through the wrapper observe a transaction all at once.
/// Wrapper operations take the gate recursively, so loaders and listeners
/// may call back into the wrapper while a commit is waiting.
pub struct TransactionalCache<K, V, C> {
    inner: C,
    gate: RwLock<()>,
    listener: Arc<CommitListener<K, V>>,
}

impl<K, V, C> TransactionalCache<K, V, C>
where
    K: CacheKey,
    V: CacheValue,
    C: Cache<K, V>,
{
    /// Builds the wrapped store with `make`, routing the eviction listener of
    /// `hooks` through the wrapper.
    ///
    /// # Example
    /// ```ignore
    /// let cache = TransactionalCache::new(hooks, |hooks| HeapCache::new("orders", 128, hooks))?;
    /// ```
    pub fn new<F>(hooks: CacheHooks<K, V>, make: F) -> Result<Self>
    where
        F: FnOnce(CacheHooks<K, V>) -> Result<C>,
    {
        let listener = Arc::new(CommitListener::new(Arc::clone(&hooks.listener)));
        let inner = make(CacheHooks {
            listener: listener.clone(),
            ..hooks
        })?;
        Ok(Self {
            inner,
            gate: RwLock::new(()),
            listener,
        })
    }

    /// Starts a transaction against this store.
    pub fn begin(&self) -> Transaction<'_, K, V, C> {
        Transaction {
            cache: self,
            staged: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Puts back what a failed commit changed.
    ///
    /// `before` holds each touched key's value from before the commit;
    /// `evicted` holds entries the commit pushed out. Entries of untouched
    /// keys among them are reinstated.
    fn restore(&self, before: Vec<(K, Option<V>)>, evicted: Vec<(K, V)>) {
        let touched: HashSet<&K> = before.iter().map(|(key, _)| key).collect();
        let reinstated: Vec<(K, V)> = evicted
            .into_iter()
            .filter(|(key, _)| !touched.contains(key))
            .collect();

        // removals first so the puts below never need to evict
        for (key, previous) in &before {
            if previous.is_none() {
                if let Err(err) = self.inner.remove(key) {
                    warn!(cache = %self.inner.name(), key = ?key, error = %err, "Undo failed");
                }
            }
        }
        let restored = before
            .iter()
            .filter_map(|(key, previous)| previous.as_ref().map(|value| (key, value)))
            .chain(reinstated.iter().map(|(key, value)| (key, value)));
        for (key, value) in restored {
            if let Err(err) = self.inner.put(key.clone(), value.clone()) {
                warn!(cache = %self.inner.name(), key = ?key, error = %err, "Undo failed");
            }
        }
    }
}

impl<K, V, C> Cache<K, V> for TransactionalCache<K, V, C>
where
    K: CacheKey,
    V: CacheValue,
    C: Cache<K, V>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        let _gate = self.gate.read_recursive();
        self.inner.put(key, value)
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        let _gate = self.gate.read_recursive();
        self.inner.get(key)
    }

    fn peek(&self, key: &K) -> Result<Option<V>> {
        let _gate = self.gate.read_recursive();
        self.inner.peek(key)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        let _gate = self.gate.read_recursive();
        self.inner.remove(key)
    }

    fn contains(&self, key: &K) -> bool {
        let _gate = self.gate.read_recursive();
        self.inner.contains(key)
    }

    fn clear(&self) -> Result<()> {
        let _gate = self.gate.read_recursive();
        self.inner.clear()
    }

    fn len(&self) -> usize {
        let _gate = self.gate.read_recursive();
        self.inner.len()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.stats()
    }

    fn execute(&self, query: &Query) -> Result<Vec<V>> {
        let _gate = self.gate.read_recursive();
        self.inner.execute(query)
    }
}

// == Transaction ==
/// Staged mutations against a [`TransactionalCache`].
///
/// Dropping a transaction without committing rolls it back.
pub struct Transaction<'a, K, V, C> {
    cache: &'a TransactionalCache<K, V, C>,
    staged: HashMap<K, Staged<V>>,
    order: Vec<K>,
}

impl<'a, K, V, C> Transaction<'a, K, V, C>
where
    K: CacheKey,
    V: CacheValue,
    C: Cache<K, V>,
{
    fn stage(&mut self, key: K, op: Staged<V>) {
        if self.staged.insert(key.clone(), op).is_none() {
            self.order.push(key);
        }
    }

    /// Stages a put.
    pub fn put(&mut self, key: K, value: V) {
        self.stage(key, Staged::Put(value));
    }

    /// Stages a removal and returns the value this transaction currently sees.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let previous = self.peek(key)?;
        self.stage(key.clone(), Staged::Remove);
        Ok(previous)
    }

    /// Reads through the staged writes, falling back to the wrapped store.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match self.staged.get(key) {
            Some(Staged::Put(value)) => Ok(Some(value.clone())),
            Some(Staged::Remove) => Ok(None),
            None => self.cache.get(key),
        }
    }

    /// Like [`get`](Self::get) without statistics or loading.
    pub fn peek(&self, key: &K) -> Result<Option<V>> {
        match self.staged.get(key) {
            Some(Staged::Put(value)) => Ok(Some(value.clone())),
            Some(Staged::Remove) => Ok(None),
            None => self.cache.peek(key),
        }
    }

    /// Number of keys with staged work.
    pub fn pending(&self) -> usize {
        self.order.len()
    }

    /// Applies the staged mutations in staging order.
    ///
    /// All or nothing: when an operation fails, the ones already applied are
    /// undone and the error names the failing position. Eviction listeners
    /// hear about a successful commit once the write gate is released, and
    /// hear nothing from a failed one.
    pub fn commit(mut self) -> Result<()> {
        let cache = self.cache;
        let order = std::mem::take(&mut self.order);
        let total = order.len();

        let (outcome, events) = {
            let _gate = cache.gate.write();
            cache.listener.hold();
            let outcome = self.apply(order);
            (outcome, cache.listener.release())
        };

        match outcome {
            Ok(()) => {
                cache.listener.deliver(&events);
                debug!(cache = %cache.name(), operations = total, "Transaction committed");
                Ok(())
            }
            Err((position, err)) => {
                warn!(cache = %cache.name(), position, total, error = %err, "Commit undone");
                Err(CacheError::Transaction(format!(
                    "operation {} of {} failed: {}",
                    position + 1,
                    total,
                    err
                )))
            }
        }
    }

    /// Runs under the write gate. Captures each touched key's value first so
    /// a failure can be undone.
    fn apply(&mut self, order: Vec<K>) -> std::result::Result<(), (usize, CacheError)> {
        let cache = self.cache;
        let before = order
            .iter()
            .map(|key| cache.inner.peek(key).map(|previous| (key.clone(), previous)))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| (0, err))?;

        for (position, key) in order.into_iter().enumerate() {
            let outcome = match self.staged.remove(&key) {
                Some(Staged::Put(value)) => cache.inner.put(key, value),
                Some(Staged::Remove) => cache.inner.remove(&key).map(|_| ()),
                None => Ok(()),
            };
            if let Err(err) = outcome {
                cache.restore(before, cache.listener.drain());
                return Err((position, err));
            }
        }
        Ok(())
    }

    /// Discards every staged mutation.
    pub fn rollback(mut self) {
        debug!(cache = %self.cache.name(), discarded = self.order.len(), "Transaction rolled back");
        self.staged.clear();
        self.order.clear();
    }
}
