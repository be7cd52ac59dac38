//! spec.md §8 scenario 2 ("Crash before checkpoint") and the checkpoint
//! durability/LSN contract of §4.G and §6.

use bufftree::{Engine, EngineConfig};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn only_checkpointed_writes_survive_a_simulated_crash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    engine.insert(b"alpha", b"1").unwrap();
    engine.checkpoint(10).unwrap();
    assert_eq!(engine.last_lsn(), 10);

    // "beta" is applied to the live, in-memory engine but never reaches a
    // checkpoint — standing in for a crash that loses everything after the
    // last durable fsync (spec.md §8 scenario 2). We never call `close` or
    // `checkpoint` again on `engine`, and open a fresh handle on the same
    // file to observe only what actually reached disk.
    engine.insert(b"beta", b"2").unwrap();

    let recovered = Engine::open(&path, EngineConfig::default(), u64::MAX).unwrap();
    assert_eq!(recovered.get(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(
        recovered.get(b"beta").unwrap(),
        None,
        "writes after the last checkpoint must not survive without WAL replay"
    );
    assert_eq!(recovered.last_lsn(), 10);
}

#[test]
fn checkpoint_lsn_advances_and_is_durable_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    engine.insert(b"k1", b"v1").unwrap();
    engine.checkpoint(5).unwrap();
    engine.insert(b"k2", b"v2").unwrap();
    engine.checkpoint(6).unwrap();
    engine.close().unwrap();

    let reopened = Engine::open(&path, EngineConfig::default(), u64::MAX).unwrap();
    assert_eq!(reopened.last_lsn(), 6);
    assert_eq!(reopened.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(reopened.get(b"k2").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn open_rejects_a_max_acceptable_lsn_below_every_surviving_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    // Three checkpoints (counting `create`'s own initial one at lsn 0) so
    // the alternating two-slot header has overwritten the lsn-0 slot by
    // the time we're done, leaving no header on disk with checkpoint_lsn
    // low enough to satisfy an overly conservative cap.
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    engine.insert(b"k", b"v").unwrap();
    engine.checkpoint(3).unwrap();
    engine.insert(b"k2", b"v2").unwrap();
    engine.checkpoint(5).unwrap();
    drop(engine);

    let err = Engine::open(&path, EngineConfig::default(), 1).unwrap_err();
    assert!(matches!(err, bufftree::StoreError::TooNew));
}

/// spec.md §8 scenario 4: reopening with a `max_acceptable_lsn` below the
/// newest checkpoint's LSN must fall back to the previous, still-acceptable
/// checkpoint rather than failing outright.
#[test]
fn open_with_max_acceptable_lsn_falls_back_to_older_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    engine.insert(b"k1", b"v1").unwrap();
    engine.checkpoint(5).unwrap();
    engine.insert(b"k2", b"v2").unwrap();
    engine.checkpoint(6).unwrap();
    engine.close().unwrap();

    let reopened = Engine::open(&path, EngineConfig::default(), 5).unwrap();
    assert_eq!(reopened.last_lsn(), 5);
    assert_eq!(reopened.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(
        reopened.get(b"k2").unwrap(),
        None,
        "a checkpoint taken after the caller's max_acceptable_lsn must not be selected"
    );
}

/// spec.md §8 scenario 4: every write whose MSN was generated before
/// checkpoint-begin is visible in the checkpoint, and none generated after
/// begin are — because `begin_checkpoint` takes its point-in-time clones
/// synchronously before returning, not deferred to `end_checkpoint`.
#[test]
fn checkpoint_captures_exactly_the_writes_made_before_begin() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();

    engine.insert(b"before", b"1").unwrap();
    engine.begin_checkpoint(2).unwrap();

    // These inserts complete strictly after `begin_checkpoint` has already
    // taken its snapshots, so they must not leak into this checkpoint even
    // though `end_checkpoint` hasn't written anything out yet.
    let writer = Arc::clone(&engine);
    let handle = std::thread::spawn(move || {
        for i in 0..200u32 {
            writer.insert(format!("after{i}").as_bytes(), b"v").unwrap();
        }
    });
    handle.join().unwrap();

    engine.end_checkpoint().unwrap();

    let snapshot = Engine::open(&path, EngineConfig::default(), 2).unwrap();
    assert_eq!(snapshot.get(b"before").unwrap(), Some(b"1".to_vec()));
    for i in 0..200u32 {
        assert_eq!(
            snapshot.get(format!("after{i}").as_bytes()).unwrap(),
            None,
            "writes issued after checkpoint-begin must not appear in the checkpoint"
        );
    }
}

/// Concurrent writers racing with a checkpoint's begin/end window must not
/// deadlock or corrupt state, even though the ones that land mid-`begin`
/// may or may not make it into that particular checkpoint.
#[test]
fn checkpoint_runs_safely_alongside_concurrent_inserts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let engine = Engine::create(&path, EngineConfig::default()).unwrap();
    engine.insert(b"seed", b"0").unwrap();
    engine.checkpoint(1).unwrap();

    let writer = Arc::clone(&engine);
    let handle = std::thread::spawn(move || {
        for i in 0..200u32 {
            writer.insert(format!("k{i}").as_bytes(), b"v").unwrap();
        }
    });

    engine.begin_checkpoint(2).unwrap();
    engine.end_checkpoint().unwrap();
    handle.join().unwrap();

    engine.checkpoint(3).unwrap();
    for i in 0..200u32 {
        assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), Some(b"v".to_vec()));
    }
}
