//! The capability trait a file hands the cache: `fetch`,
//! `partial_fetch_required`, `partial_fetch`, `flush`, `pe_est`, `pe`,
//! `cleaner`, `clone_for_checkpoint`, `checkpoint_complete`. The cache is
//! generic over one implementation of this trait per open file, so a
//! background thread can call through it without knowing the concrete
//! file type.

use crate::block::BlockNum;
use crate::error::Result;
use crate::node::Node;

/// Cheap-vs-expensive classification returned by [`CacheFile::pe_est`], used
/// by the eviction clock to decide whether to run partial eviction inline
/// or hand it to the background writer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialEvictionCost {
    /// Safe to run on the calling thread without stalling it noticeably.
    Cheap,
    /// Must be enqueued for a background writer-pool thread.
    Expensive,
    /// Nothing more can be dropped from this node.
    Nothing,
}

/// Per-file capability object the cache drives a node's lifecycle through.
/// One implementation per open file; the cache itself is generic over it
/// rather than storing raw function pointers plus an opaque argument.
pub trait CacheFile: Send + Sync {
    /// Reads `blocknum` from disk and reconstructs an in-memory [`Node`].
    /// Returns the node together with its resident byte size (for the
    /// cache's byte-budget accounting).
    ///
    /// # Errors
    /// Returns a [`crate::error::StoreError`] on I/O or corruption; the
    /// cache removes the placeholder pair it had inserted.
    fn fetch(&self, blocknum: BlockNum) -> Result<(Node, usize)>;

    /// True if `node` currently has any partition in `OnDisk`/`Compressed`
    /// state that a caller needing the full node must bring to `Avail`
    /// before proceeding.
    fn partial_fetch_required(&self, node: &Node) -> bool;

    /// Brings every non-`Avail` partition of `node` to `Avail` by reading
    /// (and, were a codec wired in, decompressing) its sub-block.
    ///
    /// # Errors
    /// Returns a [`crate::error::StoreError`] on I/O or corruption.
    fn partial_fetch(&self, node: &mut Node) -> Result<()>;

    /// Writes `node` durably at a freshly allocated extent and records the
    /// new translation. `keep_me` is `false` when the pair is being evicted
    /// and the in-memory value will be dropped right after this call
    /// returns.
    ///
    /// # Errors
    /// Returns a [`crate::error::StoreError`] on I/O failure.
    fn flush(&self, blocknum: BlockNum, node: &Node, keep_me: bool) -> Result<()>;

    /// Classifies how expensive partial eviction would be for `node`
    /// right now.
    fn pe_est(&self, node: &Node) -> PartialEvictionCost;

    /// Drops partitions from `node` to reduce its resident size, returning
    /// the number of bytes freed. Only touches partitions whose current
    /// state allows a clean transition (`Avail -> Compressed -> OnDisk`);
    /// never evicts a dirty partition to `OnDisk`.
    fn pe(&self, node: &mut Node) -> usize;

    /// Flushes messages from `node` (an internal node with the largest
    /// `workdone` child, chosen by the caller) toward one child, driven by
    /// the cleaner thread rather than a foreground insert.
    ///
    /// # Errors
    /// Returns a [`crate::error::StoreError`] on I/O failure during the
    /// resulting child write.
    fn cleaner(&self, node: &mut Node) -> Result<()>;

    /// Produces a shallow immutable snapshot of `node` for checkpoint. The
    /// clone is taken under the pair's write lock and serialized afterward
    /// without blocking further modification of the live pair.
    fn clone_for_checkpoint(&self, node: &Node) -> Node;

    /// Called once the checkpoint clone of `blocknum` has been written
    /// durably; the file may free the clone's resources here.
    fn checkpoint_complete(&self, blocknum: BlockNum);
}
