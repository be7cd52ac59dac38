//! spec.md §8 scenario 5: "Partial eviction" — under a tight cache budget,
//! point queries across many leaves must still return correct results,
//! and the cache should actually exercise partial/full eviction rather
//! than silently growing past its budget.

use bufftree::{Engine, EngineConfig};
use tempfile::tempdir;

#[test]
fn point_queries_survive_a_tight_cache_budget() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let mut config = EngineConfig::tiny();
    // A handful of node-sizes' worth of budget: enough to make progress,
    // tight enough to force eviction well before all leaves are resident.
    config.cache_budget_bytes = 2 * u64::from(config.nodesize);
    let engine = Engine::create(&path, config).unwrap();

    let n_keys = 3_000u32;
    for i in 0..n_keys {
        let key = format!("{i:062}").into_bytes();
        engine.insert(&key, &vec![b'x'; 200]).unwrap();
    }

    for i in 0..n_keys {
        let key = format!("{i:062}").into_bytes();
        let got = engine.get(&key).unwrap();
        assert_eq!(got, Some(vec![b'x'; 200]), "key {i} unreadable under eviction pressure");
    }

    let metrics = engine.cache_metrics();
    assert!(
        metrics.clock_evictions > 0 || metrics.partial_evictions > 0,
        "a 2-node cache budget over {n_keys} keys should have triggered eviction: {metrics:?}"
    );
}
