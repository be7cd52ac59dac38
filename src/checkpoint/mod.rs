//! Component G: the checkpointer (spec.md §4.G).
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/ft-checkpoint.cc`
//! (`toku_checkpoint`'s begin/write/end phases) and on the teacher's
//! `recovery::wasp::checkpoint` module, which drives the identical
//! begin-snapshot / write-clones / publish-header sequence over its own
//! segment manifest.

mod translation_table;

pub use translation_table::{decode_translation_table, encode_translation_table};

use crate::block::{BlockTable, View};
use crate::cache::{CacheFile, CacheTable};
use crate::error::Result;
use crate::header::FileHeader;
use parking_lot::RwLock;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

/// Coordinates one checkpoint across the cache and the block table,
/// producing a durable header at the end (spec.md §4.G "Begin / Write /
/// End").
pub struct Checkpointer<F: CacheFile> {
    cache: Arc<CacheTable<F>>,
    block_table: Arc<RwLock<BlockTable>>,
}

impl<F: CacheFile> Checkpointer<F> {
    #[must_use]
    pub fn new(cache: Arc<CacheTable<F>>, block_table: Arc<RwLock<BlockTable>>) -> Self {
        Self { cache, block_table }
    }

    /// Begin: marks every currently-dirty pair checkpoint-pending, takes
    /// each one's point-in-time clone right now, and snapshots the block
    /// table into `inprogress` (spec.md §4.G step 1). Writes issued after
    /// this call returns do not affect what the checkpoint captures.
    pub fn begin(&self) {
        self.cache.begin_checkpoint();
        self.block_table.write().checkpoint_begin();
        log::info!("checkpoint begin");
    }
}

/// A rewritten pair's old and new extent, tracked between `write` and
/// `end` so `end` knows which old extents to free (spec.md §4.G step 3
/// "free the old extents of every pair that was rewritten").
pub struct RewrittenPair {
    pub blocknum: crate::block::BlockNum,
    pub old_offset: Option<u64>,
}

/// Writes every checkpoint-pending pair, using the point-in-time clone
/// [`Checkpointer::begin`] already took for it so writers were never
/// blocked for the duration of the write (spec.md §4.G step 2, §4.E
/// "Clone-for-checkpoint"). `write_clone` does the actual
/// serialize-and-allocate-against-`inprogress` work; it is supplied by the
/// engine since only the engine's [`CacheFile`] implementation knows how
/// to serialize a concrete node.
///
/// # Errors
/// Propagates I/O or corruption errors from `write_clone`; a checkpoint
/// that fails here aborts without touching in-memory state (spec.md §7).
pub fn write_pending<F, W>(
    cache: &Arc<CacheTable<F>>,
    block_table: &Arc<RwLock<BlockTable>>,
    mut write_clone: W,
) -> Result<Vec<RewrittenPair>>
where
    F: CacheFile,
    W: FnMut(crate::block::BlockNum, &crate::node::Node) -> Result<()>,
{
    let mut rewritten = Vec::new();
    for pair in cache.checkpoint_pending_pairs() {
        let blocknum = pair.key.blocknum;
        let old_offset = block_table.read().get(View::Current, blocknum).ok().map(|t| t.offset);
        let clone = cache.checkpoint_clone(&pair);
        write_clone(blocknum, &clone)?;
        cache.checkpoint_pair_complete(&pair);
        rewritten.push(RewrittenPair { blocknum, old_offset });
    }
    Ok(rewritten)
}

/// Publishes the checkpoint's rewritten translations from `inprogress`
/// into `current`, writes the translation-table blob and a new header
/// slot, fsyncs twice (spec.md §4.G step 3), and finally frees the old
/// extents the checkpoint superseded.
///
/// # Errors
/// Propagates I/O errors from the file or corruption from an inconsistent
/// translation table. A failure here leaves the previous header slot
/// (and therefore every prior checkpoint) intact.
pub fn end(
    file: &mut std::fs::File,
    block_table: &Arc<RwLock<BlockTable>>,
    rewritten: Vec<RewrittenPair>,
    mut header: FileHeader,
) -> Result<FileHeader> {
    {
        let mut table = block_table.write();
        for r in &rewritten {
            let new_translation = table.get(View::InProgress, r.blocknum)?;
            table.assign(View::Current, r.blocknum, new_translation)?;
        }
    }

    let old_translation_loc = header.translation_loc;
    let old_translation_size = header.translation_size;

    let entries: Vec<_> = block_table.read().iter_view(View::Current).collect();
    let table_bytes = encode_translation_table(&entries);
    let table_offset = block_table.write().allocator_mut().alloc(table_bytes.len() as u64)?;
    file.seek(SeekFrom::Start(table_offset))?;
    file.write_all(&table_bytes)?;
    file.sync_all()?;

    for r in &rewritten {
        if let Some(old_offset) = r.old_offset {
            let new_offset = block_table.read().get(View::Current, r.blocknum)?.offset;
            if old_offset != new_offset {
                block_table.write().allocator_mut().free(old_offset)?;
            }
        }
    }

    header.checkpoint_count += 1;
    header.translation_loc = table_offset;
    header.translation_size = table_bytes.len() as u64;
    let slot = header.write_slot()?;
    let slot_offset = FileHeader::slot_offset_for_checkpoint_count(header.checkpoint_count);
    file.seek(SeekFrom::Start(slot_offset))?;
    file.write_all(&slot)?;
    file.sync_all()?;

    // Only now that the new header slot is durable is it safe to free the
    // prior translation table's extent: until this point a crash must
    // still be able to fall back to the old header and find its
    // translation table intact.
    if old_translation_size > 0 && old_translation_loc != table_offset {
        block_table.write().allocator_mut().free(old_translation_loc)?;
    }

    log::info!(
        "checkpoint end: checkpoint_count={} lsn={} rewritten={}",
        header.checkpoint_count,
        header.checkpoint_lsn,
        rewritten.len()
    );
    Ok(header)
}
