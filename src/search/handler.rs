//! Thread-safe index handler.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::search::index::AttributeIndex;
use crate::search::{AttributeValue, IndexHandler, IndexType, Indexable, Query};

type Extractor<V> = Arc<dyn Fn(&V, &str) -> Option<AttributeValue> + Send + Sync>;

// == Concurrent Index Handler ==
/// Index handler safe for concurrent use by every store variant.
///
/// All indexes sit behind one read-write lock: mutations take the write side,
/// queries the read side, so a query observes some serialization of the adds
/// and removes that completed before it.
pub struct ConcurrentIndexHandler<K, V> {
    extractor: Extractor<V>,
    indexes: RwLock<HashMap<String, Box<dyn AttributeIndex<K>>>>,
}

impl<K, V> ConcurrentIndexHandler<K, V>
where
    K: 'static,
    V: Indexable + 'static,
{
    /// Creates a handler that reads attributes through [`Indexable`].
    pub fn new() -> Self {
        Self::with_extractor(|value: &V, name: &str| value.attribute(name))
    }
}

impl<K, V> Default for ConcurrentIndexHandler<K, V>
where
    K: 'static,
    V: Indexable + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ConcurrentIndexHandler<K, V> {
    /// Creates a handler with a custom attribute accessor.
    pub fn with_extractor<F>(extractor: F) -> Self
    where
        F: Fn(&V, &str) -> Option<AttributeValue> + Send + Sync + 'static,
    {
        Self {
            extractor: Arc::new(extractor),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the registered index type of an attribute.
    pub fn index_type(&self, attribute: &str) -> Option<IndexType> {
        self.indexes.read().get(attribute).map(|i| i.index_type())
    }
}

impl<K, V> ConcurrentIndexHandler<K, V>
where
    K: Hash + Eq + Clone,
{
    fn evaluate(
        indexes: &HashMap<String, Box<dyn AttributeIndex<K>>>,
        query: &Query,
    ) -> Result<Vec<K>> {
        match query {
            Query::Compare {
                attribute,
                predicate,
            } => indexes
                .get(attribute)
                .map(|index| index.lookup(predicate))
                .ok_or_else(|| CacheError::UnknownAttribute(attribute.clone())),
            Query::And(left, right) => {
                let left = Self::evaluate(indexes, left)?;
                let right: HashSet<K> = Self::evaluate(indexes, right)?.into_iter().collect();
                Ok(left.into_iter().filter(|k| right.contains(k)).collect())
            }
            Query::Or(left, right) => {
                let mut keys = Self::evaluate(indexes, left)?;
                let mut seen: HashSet<K> = keys.iter().cloned().collect();
                for key in Self::evaluate(indexes, right)? {
                    if seen.insert(key.clone()) {
                        keys.push(key);
                    }
                }
                Ok(keys)
            }
        }
    }
}

impl<K, V> IndexHandler<K, V> for ConcurrentIndexHandler<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: 'static,
{
    fn add_index(&self, attribute: &str, index_type: IndexType) {
        let mut indexes = self.indexes.write();
        if !indexes.contains_key(attribute) {
            debug!(attribute, ?index_type, "Registering index");
            indexes.insert(attribute.to_string(), index_type.build());
        }
    }

    fn add(&self, key: &K, value: &V) {
        let mut indexes = self.indexes.write();
        for (name, index) in indexes.iter_mut() {
            if let Some(attribute) = (self.extractor)(value, name) {
                index.insert(attribute, key.clone());
            }
        }
    }

    fn remove(&self, key: &K, value: &V) {
        let mut indexes = self.indexes.write();
        for (name, index) in indexes.iter_mut() {
            if let Some(attribute) = (self.extractor)(value, name) {
                index.remove(&attribute, key);
            }
        }
    }

    fn clear(&self) {
        for index in self.indexes.write().values_mut() {
            index.clear();
        }
    }

    fn execute(&self, query: &Query) -> Result<Vec<K>> {
        let indexes = self.indexes.read();
        if let Some(unknown) = query
            .attributes()
            .into_iter()
            .find(|name| !indexes.contains_key(*name))
        {
            return Err(CacheError::UnknownAttribute(unknown.to_string()));
        }
        Self::evaluate(&indexes, query)
    }

    fn matches(&self, value: &V, query: &Query) -> bool {
        query.matches(&|name: &str| (self.extractor)(value, name))
    }
}

impl<K, V> fmt::Debug for ConcurrentIndexHandler<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attributes: Vec<String> = self.indexes.read().keys().cloned().collect();
        f.debug_struct("ConcurrentIndexHandler")
            .field("attributes", &attributes)
            .finish()
    }
}
