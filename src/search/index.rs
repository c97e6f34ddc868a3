//! Attribute index implementations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::search::{AttributeValue, Predicate};

// == Index Type ==
/// Storage strategy of one attribute index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    /// One key per attribute value; a later add replaces the earlier key
    UniqueHash,
    /// Any number of keys per attribute value
    NonUniqueHash,
    /// Ordered by attribute value; range predicates scan only matching buckets
    Range,
}

impl IndexType {
    pub(crate) fn build<K>(self) -> Box<dyn AttributeIndex<K>>
    where
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    {
        match self {
            IndexType::UniqueHash => Box::new(UniqueHashIndex::default()),
            IndexType::NonUniqueHash => Box::new(HashIndex::default()),
            IndexType::Range => Box::new(RangeIndex::default()),
        }
    }
}

/// Bucket storage behind one registered attribute.
pub(crate) trait AttributeIndex<K>: Debug + Send + Sync {
    fn index_type(&self) -> IndexType;

    fn insert(&mut self, value: AttributeValue, key: K);

    fn remove(&mut self, value: &AttributeValue, key: &K);

    fn clear(&mut self);

    /// Keys whose attribute satisfies the predicate.
    fn lookup(&self, predicate: &Predicate) -> Vec<K>;
}

// == Non-unique Hash Index ==
#[derive(Debug)]
struct HashIndex<K> {
    buckets: HashMap<AttributeValue, HashSet<K>>,
}

impl<K> Default for HashIndex<K> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }
}

impl<K> AttributeIndex<K> for HashIndex<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
{
    fn index_type(&self) -> IndexType {
        IndexType::NonUniqueHash
    }

    fn insert(&mut self, value: AttributeValue, key: K) {
        self.buckets.entry(value).or_default().insert(key);
    }

    fn remove(&mut self, value: &AttributeValue, key: &K) {
        if let Some(bucket) = self.buckets.get_mut(value) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(value);
            }
        }
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }

    fn lookup(&self, predicate: &Predicate) -> Vec<K> {
        match predicate {
            Predicate::Eq(value) => self
                .buckets
                .get(value)
                .map(|bucket| bucket.iter().cloned().collect())
                .unwrap_or_default(),
            _ => self
                .buckets
                .iter()
                .filter(|(value, _)| predicate.matches(value))
                .flat_map(|(_, bucket)| bucket.iter().cloned())
                .collect(),
        }
    }
}

// == Unique Hash Index ==
/// One key per value: the most recent live owner answers lookups.
///
/// Earlier owners are remembered so that removing the current owner hands
/// the value back to the next most recent key still holding it.
#[derive(Debug)]
struct UniqueHashIndex<K> {
    owners: HashMap<AttributeValue, Vec<K>>,
}

impl<K> Default for UniqueHashIndex<K> {
    fn default() -> Self {
        Self {
            owners: HashMap::new(),
        }
    }
}

impl<K> AttributeIndex<K> for UniqueHashIndex<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
{
    fn index_type(&self) -> IndexType {
        IndexType::UniqueHash
    }

    fn insert(&mut self, value: AttributeValue, key: K) {
        let owners = self.owners.entry(value).or_default();
        owners.retain(|owner| owner != &key);
        owners.push(key);
    }

    fn remove(&mut self, value: &AttributeValue, key: &K) {
        if let Some(owners) = self.owners.get_mut(value) {
            owners.retain(|owner| owner != key);
            if owners.is_empty() {
                self.owners.remove(value);
            }
        }
    }

    fn clear(&mut self) {
        self.owners.clear();
    }

    fn lookup(&self, predicate: &Predicate) -> Vec<K> {
        match predicate {
            Predicate::Eq(value) => self
                .owners
                .get(value)
                .and_then(|owners| owners.last())
                .cloned()
                .into_iter()
                .collect(),
            _ => self
                .owners
                .iter()
                .filter(|(value, _)| predicate.matches(value))
                .filter_map(|(_, owners)| owners.last().cloned())
                .collect(),
        }
    }
}

// == Range Index ==
#[derive(Debug)]
struct RangeIndex<K> {
    buckets: BTreeMap<AttributeValue, HashSet<K>>,
}

impl<K> Default for RangeIndex<K> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }
}

impl<K> AttributeIndex<K> for RangeIndex<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
{
    fn index_type(&self) -> IndexType {
        IndexType::Range
    }

    fn insert(&mut self, value: AttributeValue, key: K) {
        self.buckets.entry(value).or_default().insert(key);
    }

    fn remove(&mut self, value: &AttributeValue, key: &K) {
        if let Some(bucket) = self.buckets.get_mut(value) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(value);
            }
        }
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Keys come back in attribute order.
    fn lookup(&self, predicate: &Predicate) -> Vec<K> {
        let matching: Box<dyn Iterator<Item = (&AttributeValue, &HashSet<K>)> + '_> =
            match predicate.bounds() {
                Some(bounds) => Box::new(self.buckets.range::<AttributeValue, _>(bounds)),
                None => Box::new(self.buckets.iter()),
            };
        matching
            .filter(|(value, _)| predicate.matches(value))
            .flat_map(|(_, bucket)| bucket.iter().cloned())
            .collect()
    }
}
