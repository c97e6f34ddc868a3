//! Integration Tests for the Store Variants
//!
//! Drives every store through the public `Cache` contract.

use std::sync::Arc;

use imcache::{
    Cache, CacheBuilder, CacheConfig, CacheEntry, CacheError, CachePopulator, IndexType,
    JsonSerializer, PopulateReport, Query,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// == Helper Functions ==

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Evictions = Arc<Mutex<Vec<(u32, String)>>>;

/// Builds each store variant with capacity 2 and a recording listener.
fn every_variant() -> Vec<(Box<dyn Cache<u32, String>>, Evictions)> {
    let config = CacheConfig {
        segments: 1,
        ..CacheConfig::default().with_name("it").with_capacity(2)
    };
    let builder = || {
        let evictions: Evictions = Arc::default();
        let sink = Arc::clone(&evictions);
        let builder = CacheBuilder::<u32, String>::new(config.clone()).listener(
            move |k: &u32, v: &String| {
                sink.lock().push((*k, v.clone()));
            },
        );
        (builder, evictions)
    };

    let mut variants: Vec<(Box<dyn Cache<u32, String>>, Evictions)> = Vec::new();
    let (b, e) = builder();
    variants.push((Box::new(b.heap().unwrap()), e));
    let (b, e) = builder();
    variants.push((Box::new(b.concurrent_heap().unwrap()), e));
    let (b, e) = builder();
    variants.push((Box::new(b.transactional_heap().unwrap()), e));
    let (b, e) = builder();
    variants.push((Box::new(b.off_heap(JsonSerializer::<String>::new()).unwrap()), e));
    let (b, e) = builder();
    variants.push((
        Box::new(b.versioned_off_heap(JsonSerializer::<String>::new()).unwrap()),
        e,
    ));
    variants
}

// == Contract Tests ==

#[test]
fn test_lru_eviction_across_variants() {
    init_tracing();
    for (cache, evictions) in every_variant() {
        cache.put(1, "a".to_string()).unwrap();
        cache.put(2, "b".to_string()).unwrap();
        cache.get(&1).unwrap();
        cache.put(3, "c".to_string()).unwrap();

        assert!(cache.contains(&1), "{}", cache.name());
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(*evictions.lock(), vec![(2, "b".to_string())]);
        assert_eq!(cache.len(), 2);
    }
}

#[test]
fn test_missing_key_across_variants() {
    init_tracing();
    for (cache, _) in every_variant() {
        assert_eq!(cache.get(&42).unwrap(), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(cache.hit_ratio(), 0.0);
    }
}

#[test]
fn test_remove_twice_across_variants() {
    init_tracing();
    for (cache, evictions) in every_variant() {
        cache.put(7, "seven".to_string()).unwrap();

        assert_eq!(cache.remove(&7).unwrap(), Some("seven".to_string()));
        assert_eq!(cache.remove(&7).unwrap(), None);
        assert_eq!(evictions.lock().len(), 1);
    }
}

#[test]
fn test_clear_across_variants() {
    init_tracing();
    for (cache, evictions) in every_variant() {
        cache.put(1, "a".to_string()).unwrap();
        cache.put(2, "b".to_string()).unwrap();
        cache.clear().unwrap();

        assert!(cache.is_empty());
        assert_eq!(evictions.lock().len(), 2);
        assert_eq!(cache.capacity(), 2);
    }
}

// == Query Tests ==

#[test]
fn test_and_query_on_off_heap_store() {
    init_tracing();
    let cache = CacheBuilder::<String, Value>::new(CacheConfig::default().with_capacity(16))
        .searchable()
        .add_index("attr", IndexType::NonUniqueHash)
        .add_index("attr2", IndexType::Range)
        .off_heap(JsonSerializer::<Value>::new())
        .unwrap();

    cache.put("k1".to_string(), json!({"attr": "x", "attr2": 1})).unwrap();
    cache.put("k2".to_string(), json!({"attr": "x", "attr2": 9})).unwrap();
    cache.put("k3".to_string(), json!({"attr": "y", "attr2": 12})).unwrap();

    let query = Query::eq("attr", "x").and(Query::gt("attr2", 5));
    assert_eq!(
        cache.execute(&query).unwrap(),
        vec![json!({"attr": "x", "attr2": 9})]
    );

    let either = Query::eq("attr", "y").or(Query::le("attr2", 1));
    assert_eq!(cache.execute(&either).unwrap().len(), 2);

    assert!(matches!(
        cache.execute(&Query::eq("missing", 1)),
        Err(CacheError::UnknownAttribute(name)) if name == "missing"
    ));
}

#[test]
fn test_range_query_returns_attribute_order() {
    init_tracing();
    let cache = CacheBuilder::<u32, Value>::new(CacheConfig::default().with_capacity(16))
        .searchable()
        .add_index("age", IndexType::Range)
        .heap()
        .unwrap();
    for (key, age) in [(1u32, 40), (2, 25), (3, 31), (4, 18)] {
        cache.put(key, json!({ "age": age })).unwrap();
    }

    let ages: Vec<i64> = cache
        .execute(&Query::between("age", 20, 40))
        .unwrap()
        .iter()
        .filter_map(|v| v["age"].as_i64())
        .collect();
    assert_eq!(ages, vec![25, 31, 40]);
}

// == Populator Tests ==

#[tokio::test]
async fn test_populator_fills_searchable_store() {
    init_tracing();
    let cache = Arc::new(
        CacheBuilder::<u32, Value>::new(CacheConfig::default().with_capacity(100))
            .searchable()
            .add_index("group", IndexType::NonUniqueHash)
            .heap()
            .unwrap(),
    );
    let source = Arc::new(|| -> Vec<anyhow::Result<CacheEntry<u32, Value>>> {
        (0..20u32)
            .map(|i| Ok(CacheEntry::new(i, json!({ "group": i % 4 }))))
            .collect()
    });

    let report = CachePopulator::new(cache.clone(), source)
        .populate()
        .await
        .unwrap();

    assert_eq!(report, PopulateReport { loaded: 20, failed: 0 });
    assert_eq!(cache.len(), 20);
    assert_eq!(cache.execute(&Query::eq("group", 2)).unwrap().len(), 5);
}

// == Concurrency Tests ==

#[test]
fn test_versioned_concurrent_writers_one_key() {
    init_tracing();
    let cache = Arc::new(
        CacheBuilder::<u32, String>::new(CacheConfig::default().with_capacity(8))
            .versioned_off_heap(JsonSerializer::<String>::new())
            .unwrap(),
    );
    let first = "x".repeat(300);
    let second = "y".repeat(200);

    let handles: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|value| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    cache.put(1, value.clone()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stored = cache.peek(&1).unwrap().unwrap();
    assert!(stored == first || stored == second);
}

#[test]
fn test_transaction_rollback_leaves_store_untouched() {
    init_tracing();
    let cache = CacheBuilder::<u32, String>::new(CacheConfig::default().with_capacity(4))
        .transactional_heap()
        .unwrap();
    cache.put(1, "kept".to_string()).unwrap();

    let mut tx = cache.begin();
    tx.remove(&1).unwrap();
    tx.put(2, "staged".to_string());
    tx.rollback();

    assert_eq!(cache.peek(&1).unwrap(), Some("kept".to_string()));
    assert!(!cache.contains(&2));
}
