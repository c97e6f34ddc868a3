//! Search Module
//!
//! Secondary indexes over cached values. An index handler maps attribute
//! values to the keys whose current value carries them and evaluates
//! [`Query`] trees against those mappings.

mod handler;
mod index;
mod query;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub use handler::ConcurrentIndexHandler;
pub use index::IndexType;
pub use query::{Predicate, Query};

// == Attribute Value ==
/// Literal value of an indexed attribute.
///
/// The derived order (variant first, then value) only serves as the key
/// order of range indexes; comparisons in queries never cross variants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl AttributeValue {
    /// Compares two values of the same kind. Mixed kinds are unordered.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        match (self, other) {
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => Some(a.cmp(b)),
            (AttributeValue::Int(a), AttributeValue::Int(b)) => Some(a.cmp(b)),
            (AttributeValue::Str(a), AttributeValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Str(value)
    }
}

// == Indexable ==
/// Attribute extraction for values stored in a searchable cache.
pub trait Indexable {
    /// Returns the value of the named attribute, or None if the value has none.
    fn attribute(&self, name: &str) -> Option<AttributeValue>;
}

/// Top-level fields of a JSON object are its attributes.
impl Indexable for serde_json::Value {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        match self.get(name)? {
            serde_json::Value::Bool(b) => Some(AttributeValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(AttributeValue::Int),
            serde_json::Value::String(s) => Some(AttributeValue::Str(s.clone())),
            _ => None,
        }
    }
}

// == Index Handler ==
/// Maintains attribute indexes for one cache and answers queries.
///
/// Stores call `add`/`remove` in lock-step with their own mutations.
pub trait IndexHandler<K, V>: Send + Sync {
    /// Starts tracking an attribute. Existing entries are not indexed retroactively.
    fn add_index(&self, attribute: &str, index_type: IndexType);

    /// Records the attributes of a newly stored value.
    fn add(&self, key: &K, value: &V);

    /// Undoes the bucket membership recorded by `add` for this value.
    fn remove(&self, key: &K, value: &V);

    /// Empties all buckets. Registrations are kept.
    fn clear(&self);

    /// Evaluates a query and returns the matching keys.
    fn execute(&self, query: &Query) -> Result<Vec<K>>;

    /// Whether `value` itself satisfies the query. Handlers that cannot read
    /// attributes accept every value.
    fn matches(&self, _value: &V, _query: &Query) -> bool {
        true
    }
}

// == No-op Index Handler ==
/// Index handler for caches with search disabled.
///
/// Nothing is ever registered, so every query fails with `UnknownAttribute`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexHandler;

impl<K, V> IndexHandler<K, V> for NoopIndexHandler {
    fn add_index(&self, _attribute: &str, _index_type: IndexType) {}

    fn add(&self, _key: &K, _value: &V) {}

    fn remove(&self, _key: &K, _value: &V) {}

    fn clear(&self) {}

    fn execute(&self, query: &Query) -> Result<Vec<K>> {
        let attribute = query.attributes().first().map(|a| a.to_string());
        Err(CacheError::UnknownAttribute(attribute.unwrap_or_default()))
    }
}
