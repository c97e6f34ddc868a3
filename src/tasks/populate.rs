//! Cache Populator Task
//!
//! Background task that bulk-loads a store from an external source.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry};

// == Entry Source ==
/// Produces the entries a populator inserts, once per `populate` call.
///
/// Each item is independent: a failed item does not stop the others.
pub trait EntrySource<K, V>: Send + Sync {
    fn load_entries(&self) -> Vec<anyhow::Result<CacheEntry<K, V>>>;
}

impl<K, V, F> EntrySource<K, V> for F
where
    F: Fn() -> Vec<anyhow::Result<CacheEntry<K, V>>> + Send + Sync,
{
    fn load_entries(&self) -> Vec<anyhow::Result<CacheEntry<K, V>>> {
        self()
    }
}

// == Populate Report ==
/// Outcome of one population run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PopulateReport {
    /// Entries stored through `put`
    pub loaded: usize,
    /// Entries the source failed to produce or the store rejected
    pub failed: usize,
}

// == Cache Populator ==
/// Loads a store in the background through its normal `put` path, so index
/// and listener side effects fire exactly as for caller-driven puts.
pub struct CachePopulator<K, V> {
    cache: Arc<dyn Cache<K, V>>,
    source: Arc<dyn EntrySource<K, V>>,
}

impl<K, V> CachePopulator<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new(cache: Arc<dyn Cache<K, V>>, source: Arc<dyn EntrySource<K, V>>) -> Self {
        Self { cache, source }
    }

    /// Starts a population run on the tokio blocking pool.
    ///
    /// Callers that do not care about completion may drop the handle; the
    /// run continues detached. Must be called from within a tokio runtime.
    pub fn populate(&self) -> JoinHandle<PopulateReport> {
        spawn_populator(Arc::clone(&self.cache), Arc::clone(&self.source))
    }

    /// Runs a population on the calling thread.
    pub fn populate_blocking(&self) -> PopulateReport {
        run_population(self.cache.as_ref(), self.source.as_ref())
    }
}

/// Spawns a detached population run and returns its handle.
///
/// # Example
/// ```ignore
/// let handle = spawn_populator(cache.clone(), Arc::new(|| vec![Ok(CacheEntry::new(1, "a"))]));
/// // Tests may wait for completion:
/// let report = handle.await?;
/// ```
pub fn spawn_populator<K, V>(
    cache: Arc<dyn Cache<K, V>>,
    source: Arc<dyn EntrySource<K, V>>,
) -> JoinHandle<PopulateReport>
where
    K: Send + 'static,
    V: Send + 'static,
{
    tokio::task::spawn_blocking(move || run_population(cache.as_ref(), source.as_ref()))
}

fn run_population<K, V>(cache: &dyn Cache<K, V>, source: &dyn EntrySource<K, V>) -> PopulateReport {
    info!(cache = %cache.name(), "Starting cache population");

    let mut report = PopulateReport::default();
    for item in source.load_entries() {
        let outcome = item.and_then(|entry| {
            let (key, value) = entry.into_parts();
            cache.put(key, value).map_err(anyhow::Error::from)
        });
        match outcome {
            Ok(()) => report.loaded += 1,
            Err(err) => {
                report.failed += 1;
                warn!(cache = %cache.name(), error = %err, "Skipping entry during population");
            }
        }
    }

    if report.failed > 0 {
        info!(
            cache = %cache.name(),
            loaded = report.loaded,
            failed = report.failed,
            "Cache population finished with failures"
        );
    } else {
        debug!(cache = %cache.name(), loaded = report.loaded, "Cache population finished");
    }
    report
}
