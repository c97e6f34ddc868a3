//! Serialization Module
//!
//! Converts values to bytes and back for the off-heap stores.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

// == Serializer ==
/// Stateless value <-> bytes conversion.
///
/// `deserialize(serialize(v))` must equal `v` for every value a cache stores.
pub trait Serializer<V>: Send + Sync {
    fn serialize(&self, value: &V) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<V>;
}

// == JSON Serializer ==
/// Default serializer backed by serde_json.
pub struct JsonSerializer<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonSerializer<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for JsonSerializer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for JsonSerializer<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for JsonSerializer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<V> Serializer<V> for JsonSerializer<V>
where
    V: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &V) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// == Raw Bytes Serializer ==
/// Pass-through serializer for values that already are bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Reports a value that could not be converted, keeping the cause.
pub(crate) fn serialization_error(context: &str, err: impl fmt::Display) -> CacheError {
    CacheError::Serialization(format!("{}: {}", context, err))
}
