//! spec.md §8 scenario 3: "Split" — insert enough distinct keys under a
//! small `nodesize` that the tree must grow past a single leaf, and every
//! leaf basement stays within its configured size.

use bufftree::{Engine, EngineConfig};
use tempfile::tempdir;

#[test]
fn many_inserts_grow_tree_height_under_tiny_nodesize() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::tiny()).unwrap();

    // 64-byte keys, 256-byte values, enough of them that a 64 KiB nodesize
    // forces at least one split.
    for i in 0..2_000u32 {
        let key = format!("{i:062}").into_bytes();
        assert_eq!(key.len(), 62);
        let value = vec![b'v'; 256];
        engine.insert(&key, &value).unwrap();
    }

    assert!(engine.root_height().unwrap() >= 1, "tree should have grown past a single leaf");

    // Spot-check a handful of keys across the range are all still readable.
    for i in [0u32, 1, 500, 1_000, 1_500, 1_999] {
        let key = format!("{i:062}").into_bytes();
        let got = engine.get(&key).unwrap();
        assert_eq!(got, Some(vec![b'v'; 256]), "key {i} missing after splits");
    }
}

#[test]
fn single_entry_basement_does_not_split() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();

    engine.insert(b"only-key", b"only-value").unwrap();
    assert_eq!(engine.root_height().unwrap(), 0, "a single small entry must not trigger a split");
}
