//! Configuration Module
//!
//! Handles loading and validating cache configuration from environment variables.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache name, used in diagnostics and log fields
    pub name: String,
    /// Maximum number of entries the cache can hold
    pub capacity: usize,
    /// Number of lock segments for the concurrent heap store
    pub segments: usize,
    /// Upper bound in bytes for an off-heap arena
    pub arena_limit: usize,
    /// Read attempts a versioned off-heap store makes before giving up
    pub read_retries: u32,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `IMCACHE_NAME` - Cache name (default: "imcache")
    /// - `IMCACHE_CAPACITY` - Maximum entries (default: 10000)
    /// - `IMCACHE_SEGMENTS` - Concurrent store segments (default: 16)
    /// - `IMCACHE_ARENA_LIMIT` - Off-heap arena limit in bytes (default: 64 MiB)
    /// - `IMCACHE_READ_RETRIES` - Versioned read attempts (default: 8)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env::var("IMCACHE_NAME").unwrap_or(defaults.name),
            capacity: parse_env("IMCACHE_CAPACITY").unwrap_or(defaults.capacity),
            segments: parse_env("IMCACHE_SEGMENTS").unwrap_or(defaults.segments),
            arena_limit: parse_env("IMCACHE_ARENA_LIMIT").unwrap_or(defaults.arena_limit),
            read_retries: parse_env("IMCACHE_READ_RETRIES").unwrap_or(defaults.read_retries),
        }
    }

    /// Sets the cache name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the entry capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Checks that the configuration can back a store.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "capacity must be positive".to_string(),
            ));
        }
        if self.segments == 0 {
            return Err(CacheError::InvalidConfig(
                "segments must be positive".to_string(),
            ));
        }
        if self.arena_limit == 0 {
            return Err(CacheError::InvalidConfig(
                "arena limit must be positive".to_string(),
            ));
        }
        if self.read_retries == 0 {
            return Err(CacheError::InvalidConfig(
                "read retries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "imcache".to_string(),
            capacity: 10_000,
            segments: 16,
            arena_limit: 64 * 1024 * 1024,
            read_retries: 8,
        }
    }
}
