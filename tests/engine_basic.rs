//! spec.md §8 scenario 1: "Basic insert/read" — insert three keys, read
//! them back, close, reopen, and confirm the same results survive a
//! checkpoint + reopen round trip.

use bufftree::{Engine, EngineConfig};
use tempfile::tempdir;

#[test]
fn insert_read_reopen_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    engine.insert(b"alpha", b"1").unwrap();
    engine.insert(b"beta", b"2").unwrap();
    engine.insert(b"gamma", b"3").unwrap();

    assert_eq!(engine.get(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"beta").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(b"gamma").unwrap(), Some(b"3".to_vec()));
    assert_eq!(engine.get(b"delta").unwrap(), None);

    engine.close().unwrap();

    let reopened = Engine::open(&path, EngineConfig::default(), u64::MAX).unwrap();
    assert_eq!(reopened.get(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(reopened.get(b"beta").unwrap(), Some(b"2".to_vec()));
    assert_eq!(reopened.get(b"gamma").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn delete_then_get_returns_none() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();

    engine.insert(b"k", b"v").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    engine.delete(b"k").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), None);
}

#[test]
fn overwrite_returns_latest_value() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();

    engine.insert(b"k", b"first").unwrap();
    engine.insert(b"k", b"second").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn empty_tree_get_is_not_found() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    assert_eq!(engine.get(b"anything").unwrap(), None);
}
