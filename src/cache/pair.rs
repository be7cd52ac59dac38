//! A single cache entry and the pin-mode lock protecting it.
//!
//! Each pair tracks dirtiness, an eviction clock bit, whether it's pending
//! in the current checkpoint, and a pin count, alongside the `RwLock`
//! guarding its node value. The clock bit and the other flags are atomics
//! rather than fields behind the same lock, since readers need to flip
//! them without taking an exclusive lock on the node itself.

use crate::block::BlockNum;
use crate::node::Node;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Which file a pair belongs to. This core is single-file in scope, but
/// the key is kept file-qualified (as a multi-file WAL/txn manager above
/// this core would expect) so the type doesn't need to change if a second
/// file (e.g. a side-loader's temp file) is added above this core later.
pub type FileId = u32;

/// Hash-table key for one cache entry: keyed by `(file, blocknum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub file: FileId,
    pub blocknum: BlockNum,
}

/// The lock mode a caller requests when pinning a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Shared: any number of readers may hold this concurrently.
    Read,
    /// Exclusive, expected to be released quickly (e.g. flipping a clock
    /// bit or appending one message).
    WriteCheap,
    /// Exclusive, expected to be held for a while (e.g. a split or a
    /// flush of many messages). At most one thread may hold this on a
    /// given pair at a time; enforced here by the same underlying
    /// exclusive lock as `WriteCheap`, with `write_expensive_held` as a
    /// diagnostic witness of the invariant.
    WriteExpensive,
}

/// One entry in the cache.
pub struct CachePair {
    pub key: PairKey,
    value: RwLock<Node>,
    dirty: AtomicBool,
    /// Eviction clock bit: if set, the clock sweep clears it and advances
    /// instead of evicting.
    clock_bit: AtomicBool,
    /// Set at checkpoint-begin for every pair that was dirty at that
    /// instant; cleared once this pair's checkpoint write completes.
    checkpoint_pending: AtomicBool,
    /// Pin count; always >= 0.
    pin_count: AtomicI64,
    /// Witness for "at most one writer thread may observe a pair in
    /// `WriteExpensive`"; set while a `WriteExpensive` pin is held,
    /// asserted clear on acquisition.
    write_expensive_held: AtomicBool,
    /// Cache's current byte-size estimate for this pair's resident value.
    attr_bytes: AtomicU64,
    /// Point-in-time clone taken at checkpoint-begin, before this pair can
    /// be mutated further, so the checkpoint captures the node as of begin
    /// rather than as of whenever it happens to get written out (spec.md
    /// §8 "every insert/delete whose MSN was generated before
    /// checkpoint-begin is visible in the checkpoint"). Cleared once
    /// claimed by `CacheTable::checkpoint_clone`.
    checkpoint_snapshot: Mutex<Option<Node>>,
}

impl CachePair {
    #[must_use]
    pub fn new(key: PairKey, value: Node, attr_bytes: usize, dirty: bool) -> Self {
        Self {
            key,
            value: RwLock::new(value),
            dirty: AtomicBool::new(dirty),
            clock_bit: AtomicBool::new(true),
            checkpoint_pending: AtomicBool::new(false),
            pin_count: AtomicI64::new(0),
            write_expensive_held: AtomicBool::new(false),
            attr_bytes: AtomicU64::new(attr_bytes as u64),
            checkpoint_snapshot: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn clock_bit(&self) -> bool {
        self.clock_bit.load(Ordering::Acquire)
    }

    pub fn set_clock_bit(&self, value: bool) {
        self.clock_bit.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_checkpoint_pending(&self) -> bool {
        self.checkpoint_pending.load(Ordering::Acquire)
    }

    pub fn set_checkpoint_pending(&self, value: bool) {
        self.checkpoint_pending.store(value, Ordering::Release);
    }

    /// Stashes `node` as this pair's checkpoint-begin snapshot.
    pub fn stash_checkpoint_snapshot(&self, node: Node) {
        *self.checkpoint_snapshot.lock() = Some(node);
    }

    /// Takes and clears this pair's checkpoint-begin snapshot, if any.
    pub fn take_checkpoint_snapshot(&self) -> Option<Node> {
        self.checkpoint_snapshot.lock().take()
    }

    #[must_use]
    pub fn pin_count(&self) -> i64 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// # Panics
    /// Panics if the pin count would go negative: an unpin without a
    /// matching pin is an engine-internal bug, not a recoverable
    /// condition.
    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "CachePair::unpin: pin count underflow on {:?}", self.key);
    }

    #[must_use]
    pub fn attr_bytes(&self) -> u64 {
        self.attr_bytes.load(Ordering::Acquire)
    }

    pub fn set_attr_bytes(&self, bytes: usize) {
        self.attr_bytes.store(bytes as u64, Ordering::Release);
    }

    /// Acquires the pair's value for shared (read) or exclusive (write)
    /// access, per `mode`. Blocks until available; callers that need a
    /// non-blocking try are expected to use [`Self::try_acquire`] instead.
    pub fn acquire_read(&self) -> parking_lot::RwLockReadGuard<'_, Node> {
        self.value.read()
    }

    pub fn acquire_write(&self, mode: PinMode) -> parking_lot::RwLockWriteGuard<'_, Node> {
        let guard = self.value.write();
        if mode == PinMode::WriteExpensive {
            let was_held = self.write_expensive_held.swap(true, Ordering::AcqRel);
            assert!(!was_held, "two WRITE_EXPENSIVE holders observed on {:?}", self.key);
        }
        guard
    }

    pub fn release_write(&self, mode: PinMode) {
        if mode == PinMode::WriteExpensive {
            self.write_expensive_held.store(false, Ordering::Release);
        }
    }

    /// Non-blocking variant of acquiring the lock, used by
    /// [`crate::cache::CacheTable::get_and_pin`] when the caller asked for
    /// try-again semantics instead of blocking.
    #[must_use]
    pub fn try_acquire_read(&self) -> Option<parking_lot::RwLockReadGuard<'_, Node>> {
        self.value.try_read()
    }

    #[must_use]
    pub fn try_acquire_write(&self, mode: PinMode) -> Option<parking_lot::RwLockWriteGuard<'_, Node>> {
        let guard = self.value.try_write()?;
        if mode == PinMode::WriteExpensive {
            let was_held = self.write_expensive_held.swap(true, Ordering::AcqRel);
            assert!(!was_held, "two WRITE_EXPENSIVE holders observed on {:?}", self.key);
        }
        Some(guard)
    }
}

impl std::fmt::Debug for CachePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePair")
            .field("key", &self.key)
            .field("dirty", &self.is_dirty())
            .field("clock_bit", &self.clock_bit())
            .field("checkpoint_pending", &self.is_checkpoint_pending())
            .field("pin_count", &self.pin_count())
            .field("attr_bytes", &self.attr_bytes())
            .finish()
    }
}
