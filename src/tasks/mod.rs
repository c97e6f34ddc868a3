//! Background Tasks Module
//!
//! Work that runs off the caller's thread on the tokio runtime.
//!
//! # Tasks
//! - Population: bulk-loads a store from an [`EntrySource`] through its `put` path

mod populate;

pub use populate::{spawn_populator, CachePopulator, EntrySource, PopulateReport};
