//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror. A missing key is never an
//! error: lookups report absence as `Ok(None)`.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Value could not be converted to or from bytes
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The off-heap arena cannot grow to satisfy an allocation
    #[error("Arena exhausted: requested {requested} bytes, {available} available")]
    CapacityExhausted { requested: usize, available: usize },

    /// Query references an attribute that has no registered index
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// Versioned read never observed a stable version
    #[error("Concurrent modification: read retried {attempts} times without a stable version")]
    RetryExhausted { attempts: u32 },

    /// Invalid cache configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A transaction commit failed and its applied operations were undone
    #[error("Transaction failed: {0}")]
    Transaction(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CacheError::CapacityExhausted {
            requested: 64,
            available: 8,
        };
        assert_eq!(
            err.to_string(),
            "Arena exhausted: requested 64 bytes, 8 available"
        );

        let err = CacheError::UnknownAttribute("age".to_string());
        assert_eq!(err.to_string(), "Unknown attribute: age");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
