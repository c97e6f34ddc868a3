//! Cache Entry Module
//!
//! Defines the logical (key, value) pair that flows in and out of stores.

use serde::{Deserialize, Serialize};

// == Cache Entry ==
/// A single key-value pair, e.g. one item produced by a populator source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<K, V> {
    /// The entry key
    pub key: K,
    /// The stored value
    pub value: V,
}

impl<K, V> CacheEntry<K, V> {
    // == Constructor ==
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Splits the entry into its key and value.
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for CacheEntry<K, V> {
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new("key", "value".to_string());
        assert_eq!(entry.key, "key");
        assert_eq!(entry.value, "value");
    }

    #[test]
    fn test_entry_from_tuple() {
        let entry: CacheEntry<u32, &str> = (1, "a").into();
        assert_eq!(entry.into_parts(), (1, "a"));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = CacheEntry::new(3u32, "c".to_string());
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"key":3,"value":"c"}"#);
    }
}
