//! The public engine API: ties the block allocator, block table, file
//! header, node serializer, page cache, tree node logic, and checkpointer
//! into `create`/`open`/`insert`/`delete`/`get`/`begin_checkpoint`/
//! `end_checkpoint`/`close`.
//!
//! One struct owns a cache table, a block table, and a config, exposing a
//! small blocking API while background threads (cleaner, eviction) run
//! underneath it.

mod file_backend;

pub use file_backend::FileBacking;

use crate::block::{BlockAllocator, BlockNum, BlockTable, View};
use crate::cache::{CacheFile, CacheTable, CleanerHandle, PinMode, PinnedPair};
use crate::checkpoint::{self, Checkpointer};
use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::header::{choose_current, FileHeader};
use crate::node::{
    apply_ancestor_messages, Message, MessageKind, MsnGenerator, Node, PartitionPayload,
};
use crate::tree::{self, Reactivity, FIRST_MSN};
use parking_lot::{Mutex, RwLock};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// One open storage file plus everything needed to drive it: block
/// allocator, block table, header, node serializer, page cache, tree
/// logic, and checkpointer.
pub struct Engine {
    header_file: Mutex<std::fs::File>,
    header: RwLock<FileHeader>,
    block_table: Arc<RwLock<BlockTable>>,
    cache: Arc<CacheTable<FileBacking>>,
    backing: Arc<FileBacking>,
    config: EngineConfig,
    msn_gen: MsnGenerator,
    cleaner: Mutex<Option<CleanerHandle>>,
    /// The LSN a `begin_checkpoint` is targeting, cleared by the matching
    /// `end_checkpoint`.
    pending_checkpoint_lsn: Mutex<Option<u64>>,
}

impl Engine {
    /// Creates a brand new, empty file at `path`: a single-leaf tree,
    /// written header, and an immediate first checkpoint so the file is
    /// durable and reopenable as soon as this returns.
    ///
    /// # Errors
    /// Propagates I/O failure opening or writing the file.
    pub fn create(path: impl AsRef<Path>, config: EngineConfig) -> Result<Arc<Engine>> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        let header_file = file.try_clone()?;

        let allocator = BlockAllocator::create(config.reserve_at_start, config.alignment);
        let block_table = Arc::new(RwLock::new(BlockTable::create(allocator)));
        let backing = FileBacking::new(file, Arc::clone(&block_table), config.clone());
        let cache = CacheTable::new(Arc::clone(&backing), 0, config.cache_budget_bytes);
        backing.set_cache_table(Arc::downgrade(&cache));

        let root_blocknum = block_table.write().allocate_new();
        let root = Node::new_leaf(root_blocknum, crate::config::CURRENT_LAYOUT_VERSION);
        let size = root.approx_size();
        drop(CacheTable::insert_new(&cache, root_blocknum, root, size));

        let mut header = FileHeader::new_empty(
            crate::config::CURRENT_LAYOUT_VERSION,
            1,
            config.nodesize,
            config.basement_size,
            config.fanout_target,
        );
        header.root_blocknum = root_blocknum;

        let engine = Arc::new(Engine {
            header_file: Mutex::new(header_file),
            header: RwLock::new(header),
            block_table,
            cache,
            backing,
            config,
            msn_gen: MsnGenerator::new(FIRST_MSN),
            cleaner: Mutex::new(None),
            pending_checkpoint_lsn: Mutex::new(None),
        });
        engine.checkpoint(0)?;
        engine.start_cleaner();
        log::info!("created new engine file at {:?}", path.as_ref());
        Ok(engine)
    }

    /// Opens an existing file: picks the newer of the two header slots
    /// whose `checkpoint_lsn` is still within `max_acceptable_lsn`,
    /// rejecting candidates that are too old or too new for the caller,
    /// then reloads the translation table and block allocator from it.
    ///
    /// `max_acceptable_lsn` lets a caller reopen "as of" an earlier
    /// checkpoint: pass the LSN up to which the external WAL/txn manager
    /// has replayed, and a checkpoint taken after that point is skipped in
    /// favor of an older, still-acceptable one. Pass `u64::MAX` to always
    /// accept the newest durable checkpoint.
    ///
    /// # Errors
    /// Propagates I/O failure, [`crate::error::StoreError::NoHeader`],
    /// [`crate::error::StoreError::TooOld`], or
    /// [`crate::error::StoreError::TooNew`].
    pub fn open(
        path: impl AsRef<Path>,
        config: EngineConfig,
        max_acceptable_lsn: u64,
    ) -> Result<Arc<Engine>> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header_file = file.try_clone()?;

        let mut slot0 = vec![0u8; crate::config::HEADER_RESERVE as usize];
        let mut slot1 = vec![0u8; crate::config::HEADER_RESERVE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut slot0)?;
        file.read_exact(&mut slot1)?;
        let header = choose_current(
            FileHeader::read_slot(&slot0).ok(),
            FileHeader::read_slot(&slot1).ok(),
            max_acceptable_lsn,
            crate::config::CURRENT_LAYOUT_VERSION,
        )?;

        let mut translation_bytes = vec![0u8; header.translation_size as usize];
        file.seek(SeekFrom::Start(header.translation_loc))?;
        file.read_exact(&mut translation_bytes)?;
        let entries = checkpoint::decode_translation_table(&translation_bytes)?;

        let allocator = BlockAllocator::create(config.reserve_at_start, config.alignment);
        let block_table = Arc::new(RwLock::new(BlockTable::from_translations(allocator, &entries)?));

        let backing = FileBacking::new(file, Arc::clone(&block_table), config.clone());
        let cache = CacheTable::new(Arc::clone(&backing), 0, config.cache_budget_bytes);
        backing.set_cache_table(Arc::downgrade(&cache));

        let engine = Arc::new(Engine {
            header_file: Mutex::new(header_file),
            header: RwLock::new(header),
            block_table,
            cache,
            backing,
            config,
            msn_gen: MsnGenerator::new(FIRST_MSN),
            cleaner: Mutex::new(None),
            pending_checkpoint_lsn: Mutex::new(None),
        });
        engine.start_cleaner();
        log::info!("opened engine file at {:?}", path.as_ref());
        Ok(engine)
    }

    fn start_cleaner(self: &Arc<Self>) {
        let handle = CleanerHandle::spawn(Arc::clone(&self.cache), self.config.cleaner_period, self.config.cleaner_iterations);
        *self.cleaner.lock() = Some(handle);
    }

    #[must_use]
    pub fn last_lsn(&self) -> u64 {
        self.header.read().checkpoint_lsn
    }

    /// Inserts or overwrites `key`.
    ///
    /// # Errors
    /// Propagates I/O or corruption errors surfaced while promoting the
    /// message down the tree.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply_message(Message {
            msn: self.msn_gen.next(),
            key: key.to_vec(),
            kind: MessageKind::Insert(value.to_vec()),
            xids: Vec::new(),
            fresh: true,
        })
    }

    /// Deletes `key`, a no-op if it is already absent.
    ///
    /// # Errors
    /// As [`Self::insert`].
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.apply_message(Message {
            msn: self.msn_gen.next(),
            key: key.to_vec(),
            kind: MessageKind::Delete,
            xids: Vec::new(),
            fresh: true,
        })
    }

    /// Materializes every partition of a pinned node that is still
    /// `ON_DISK`, so tree logic can read/mutate its buffers and basements
    /// directly (spec.md §4.D "on demand, a partition is transitioned
    /// `ON_DISK → COMPRESSED → AVAIL`").
    fn ensure_resident(&self, pinned: &crate::cache::PinnedPair<FileBacking>) -> Result<()> {
        if self.backing.partial_fetch_required(&pinned.read()) {
            let mut w = pinned.write();
            self.backing.partial_fetch(&mut w)?;
        }
        Ok(())
    }

    fn apply_message(&self, msg: Message) -> Result<()> {
        let root_blocknum = self.header.read().root_blocknum;
        let root_pinned = CacheTable::get_and_pin(&self.cache, root_blocknum, PinMode::WriteExpensive, true)?;
        self.ensure_resident(&root_pinned)?;
        {
            let mut root = root_pinned.write();
            tree::inject_into_node(&mut root, msg);
        }
        root_pinned.mark_dirty();

        if tree::reactivity(&root_pinned.read(), &self.config) == Reactivity::Splittable {
            self.split_root(&root_pinned)?;
        }

        let mut stats = tree::PromoteStats::new();
        let mut current = root_pinned;
        let mut depth = 0u32;
        loop {
            if depth >= self.config.max_promote_depth {
                stats.depth_bound_stops += 1;
                break;
            }
            let gorged = {
                let node = current.read();
                (0..node.n_children()).find(|&i| tree::is_child_gorged(&node, i, &self.config))
            };
            let Some(child_idx) = gorged else { break };
            let child_blocknum = current.read().children[child_idx].child_blocknum;
            if child_blocknum.is_null() {
                break;
            }
            let child = match CacheTable::get_and_pin(&self.cache, child_blocknum, PinMode::WriteExpensive, false) {
                Ok(pinned) => pinned,
                Err(crate::error::StoreError::TryAgain) => {
                    stats.lock_contention_stops += 1;
                    break;
                }
                Err(e) => return Err(e),
            };
            self.ensure_resident(&child)?;
            let flushed = {
                let mut parent = current.write();
                let mut child_node = child.write();
                tree::flush_to_child(&mut parent, child_idx, &mut child_node)
            };
            current.mark_dirty();
            child.mark_dirty();
            log::debug!("flushed {flushed} messages from {:?} to {child_blocknum:?}", current.key());

            if tree::reactivity(&child.read(), &self.config) == Reactivity::Splittable {
                self.split_child(&current, child_idx, &child)?;
            } else if self.try_merge_child(&current, child_idx, &child)? {
                // `child`'s blocknum no longer names a live node once it has
                // been absorbed into a neighbor; this promote pass stops
                // here and picks the new shape back up on the next call.
                break;
            }

            current = child;
            depth += 1;
        }
        stats.completed += 1;
        Ok(())
    }

    /// Splits the root node in place: the root keeps its blocknum (the
    /// header's `root_blocknum` never changes), and two freshly allocated
    /// blocks receive its old children, becoming the new root's two
    /// children (spec.md §4.F "Split").
    fn split_root(&self, root_pinned: &crate::cache::PinnedPair<FileBacking>) -> Result<()> {
        let mut probe = root_pinned.read().clone();
        if !tree::ensure_splittable(&mut probe, self.config.basement_size) {
            log::warn!(
                "root {:?} is gorged but holds a single basement too large to \
                 repartition at basement_size {}; leaving it unsplit",
                probe.blocknum,
                self.config.basement_size
            );
            return Ok(());
        }

        let left_blocknum = self.block_table.write().allocate_new();
        let right_blocknum = self.block_table.write().allocate_new();

        let (pivot, left_node, right_node) = {
            let mut root = root_pinned.write();
            let mut left = (*root).clone();
            left.blocknum = left_blocknum;
            tree::ensure_splittable(&mut left, self.config.basement_size);
            let result = tree::split_node(&mut left, right_blocknum);
            (result.pivot, left, result.sibling)
        };
        let left_size = left_node.approx_size();
        let right_size = right_node.approx_size();
        drop(CacheTable::insert_new(&self.cache, left_blocknum, left_node, left_size));
        drop(CacheTable::insert_new(&self.cache, right_blocknum, right_node, right_size));

        let mut root = root_pinned.write();
        let new_height = root.height + 1;
        let layout_version = root.layout_version;
        let max_msn_applied = root.max_msn_applied;
        let blocknum = root.blocknum;
        *root = Node {
            blocknum,
            height: new_height,
            dirty: true,
            layout_version,
            pivots: vec![pivot],
            children: vec![new_internal_child(left_blocknum), new_internal_child(right_blocknum)],
            max_msn_applied,
        };
        log::debug!("split root into {left_blocknum:?}, {right_blocknum:?} at new height {new_height}");
        Ok(())
    }

    /// Splits `parent`'s child at `child_idx`, inserting the new sibling
    /// and its promoted pivot into `parent` (spec.md §4.F "Split").
    fn split_child(
        &self,
        parent_pinned: &crate::cache::PinnedPair<FileBacking>,
        child_idx: usize,
        child_pinned: &crate::cache::PinnedPair<FileBacking>,
    ) -> Result<()> {
        let mut probe = child_pinned.read().clone();
        if !tree::ensure_splittable(&mut probe, self.config.basement_size) {
            log::warn!(
                "child {:?} is gorged but holds a single basement too large to \
                 repartition at basement_size {}; leaving it unsplit",
                probe.blocknum,
                self.config.basement_size
            );
            return Ok(());
        }

        let sibling_blocknum = self.block_table.write().allocate_new();
        let (pivot, sibling) = {
            let mut child = child_pinned.write();
            tree::ensure_splittable(&mut child, self.config.basement_size);
            let result = tree::split_node(&mut child, sibling_blocknum);
            (result.pivot, result.sibling)
        };
        let sibling_size = sibling.approx_size();
        drop(CacheTable::insert_new(&self.cache, sibling_blocknum, sibling, sibling_size));

        let mut parent = parent_pinned.write();
        parent.pivots.insert(child_idx, pivot);
        parent.children.insert(child_idx + 1, new_internal_child(sibling_blocknum));
        drop(parent);
        log::debug!("split {:?} into sibling {sibling_blocknum:?}", child_pinned.key());
        Ok(())
    }

    /// Attempts to merge `parent`'s child at `child_idx` into an adjacent
    /// sibling once it has become too small to stand alone (spec.md §4.F
    /// "Merge: inverse [of split], when a child is under-full and its
    /// neighbor has capacity"). Returns `true` if a merge happened, in
    /// which case `child_idx`'s former blocknum no longer names a live
    /// node and the caller must not keep descending through it.
    fn try_merge_child(
        &self,
        parent_pinned: &PinnedPair<FileBacking>,
        child_idx: usize,
        child_pinned: &PinnedPair<FileBacking>,
    ) -> Result<bool> {
        if tree::reactivity(&child_pinned.read(), &self.config) != Reactivity::Mergeable {
            return Ok(false);
        }
        let n_children = parent_pinned.read().n_children();
        let sibling_idx = if child_idx > 0 {
            child_idx - 1
        } else if child_idx + 1 < n_children {
            child_idx + 1
        } else {
            return Ok(false);
        };
        let sibling_blocknum = parent_pinned.read().children[sibling_idx].child_blocknum;
        if sibling_blocknum.is_null() {
            return Ok(false);
        }
        let sibling_pinned =
            match CacheTable::get_and_pin(&self.cache, sibling_blocknum, PinMode::WriteExpensive, false) {
                Ok(pinned) => pinned,
                Err(StoreError::TryAgain) => return Ok(false),
                Err(e) => return Err(e),
            };
        self.ensure_resident(&sibling_pinned)?;

        // Drain any messages still buffered against the sibling before
        // folding its node into the merge: those messages target keys the
        // merged node will still own, but once the sibling's `Partition`
        // entry is dropped from `parent.children` below there is nowhere
        // left to hold them.
        {
            let mut parent = parent_pinned.write();
            let mut sibling_node = sibling_pinned.write();
            tree::flush_to_child(&mut parent, sibling_idx, &mut sibling_node);
        }
        sibling_pinned.mark_dirty();

        let (left_idx, left_pinned, right_pinned) = if sibling_idx < child_idx {
            (sibling_idx, &sibling_pinned, child_pinned)
        } else {
            (child_idx, child_pinned, &sibling_pinned)
        };
        if !tree::combined_fits(&left_pinned.read(), &right_pinned.read(), self.config.nodesize) {
            return Ok(false);
        }

        let absorbed_blocknum = right_pinned.read().blocknum;
        let right_clone = right_pinned.read().clone();
        {
            let mut parent = parent_pinned.write();
            let pivot = parent.pivots.remove(left_idx);
            parent.children.remove(left_idx + 1);
            let mut left = left_pinned.write();
            tree::merge_nodes(&mut left, pivot, right_clone);
        }
        left_pinned.mark_dirty();
        parent_pinned.mark_dirty();

        self.cache.remove(absorbed_blocknum);
        let mut table = self.block_table.write();
        if table.get(View::Current, absorbed_blocknum).is_ok() {
            table.note_free(View::Current, absorbed_blocknum)?;
        }
        if table.get(View::InProgress, absorbed_blocknum).is_ok() {
            table.note_free(View::InProgress, absorbed_blocknum)?;
        }

        log::info!("merged {absorbed_blocknum:?} into {:?}", left_pinned.key());
        Ok(true)
    }

    /// Looks up `key`, applying any not-yet-flushed ancestor messages along
    /// the descent path on the fly (spec.md §4.F "a query descending
    /// through the tree must apply ... any not-yet-flushed messages from
    /// ancestor buffers").
    ///
    /// # Errors
    /// Propagates I/O or corruption errors reading a node from disk.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root_blocknum = self.header.read().root_blocknum;
        let mut ancestor_buffers = Vec::new();
        let mut current = CacheTable::get_and_pin(&self.cache, root_blocknum, PinMode::WriteCheap, true)?;
        loop {
            let needs_fetch = self.backing.partial_fetch_required(&current.read());
            if needs_fetch {
                let mut w = current.write();
                self.backing.partial_fetch(&mut w)?;
            }

            let node = current.read();
            let idx = node.child_index_for_key(key);
            if node.is_leaf() {
                let mut basement = node.children[idx]
                    .basement()
                    .expect("leaf partition resident after partial_fetch")
                    .clone();
                let key_vec = key.to_vec();
                let refs: Vec<&crate::node::MessageBuffer> = ancestor_buffers.iter().collect();
                let applied = apply_ancestor_messages(&refs, Some(&key_vec), &mut basement);
                basement.stale_ancestor_messages_applied += applied;
                return Ok(basement.get(key).and_then(crate::node::LeafEntry::committed_value).cloned());
            }
            let child_mb = node.children[idx].message_buffer().cloned();
            let child_blocknum = node.children[idx].child_blocknum;
            drop(node);
            if let Some(mb) = child_mb {
                ancestor_buffers.push(mb);
            }
            current = CacheTable::get_and_pin(&self.cache, child_blocknum, PinMode::WriteCheap, true)?;
        }
    }

    /// Begin phase of a checkpoint (spec.md §6 "core exposes ...
    /// `begin_checkpoint(lsn)`"): snapshots checkpoint-pending pairs and
    /// the block table, and records `lsn` as the value the matching
    /// [`Self::end_checkpoint`] will stamp into the new header. `lsn` is
    /// owned by the external WAL/txn manager (spec.md §1) — this core
    /// never originates one itself.
    ///
    /// # Errors
    /// Never fails on its own; the `Result` return matches
    /// [`Self::end_checkpoint`] for callers that treat the pair uniformly.
    pub fn begin_checkpoint(&self, lsn: u64) -> Result<()> {
        *self.pending_checkpoint_lsn.lock() = Some(lsn);
        let checkpointer = Checkpointer::new(Arc::clone(&self.cache), Arc::clone(&self.block_table));
        checkpointer.begin();
        Ok(())
    }

    /// End phase of a checkpoint (spec.md §6 "... `end_checkpoint(lsn)`"):
    /// clones and durably writes every checkpoint-pending pair, then
    /// publishes the rewritten translations, translation table, and a new
    /// header slot stamped with the LSN the matching
    /// [`Self::begin_checkpoint`] recorded, per spec.md §4.G "Write"/"End".
    ///
    /// # Errors
    /// Propagates I/O or corruption errors from either phase, or
    /// [`crate::error::StoreError::Corruption`] if called without a prior
    /// `begin_checkpoint`.
    pub fn end_checkpoint(&self) -> Result<()> {
        let lsn = self
            .pending_checkpoint_lsn
            .lock()
            .take()
            .ok_or_else(|| StoreError::Corruption("end_checkpoint: no matching begin_checkpoint".into()))?;

        let backing = Arc::clone(&self.backing);
        let rewritten = checkpoint::write_pending(&self.cache, &self.block_table, move |blocknum, node| {
            backing.write_checkpoint_clone(blocknum, node)
        })?;

        let mut file = self.header_file.lock();
        let mut header = self.header.read().clone();
        header.checkpoint_lsn = lsn;
        let new_header = checkpoint::end(&mut file, &self.block_table, rewritten, header)?;
        *self.header.write() = new_header;
        Ok(())
    }

    /// Runs one full checkpoint at `lsn` back to back (spec.md §4.G "Begin
    /// / Write / End"): a convenience wrapper over
    /// [`Self::begin_checkpoint`]/[`Self::end_checkpoint`] for callers (or
    /// this crate's own `create`/`close`) that have no reason to hold the
    /// two phases apart.
    ///
    /// # Errors
    /// As [`Self::end_checkpoint`].
    pub fn checkpoint(&self, lsn: u64) -> Result<()> {
        self.begin_checkpoint(lsn)?;
        self.end_checkpoint()
    }

    /// Runs a final checkpoint (at the engine's last-known LSN) and stops
    /// the background cleaner thread.
    ///
    /// # Errors
    /// Propagates I/O errors from the final checkpoint.
    pub fn close(&self) -> Result<()> {
        self.checkpoint(self.last_lsn())?;
        self.cleaner.lock().take();
        Ok(())
    }

    #[must_use]
    pub fn cache_metrics(&self) -> crate::cache::CacheMetricsSnapshot {
        self.cache.metrics.snapshot()
    }

    /// The current root node's height (0 = leaf-only tree). Diagnostic
    /// accessor, mirroring the teacher's habit of exposing plain read-only
    /// introspection (e.g. collection/document counts) for callers and
    /// tests rather than requiring a full query round-trip to observe
    /// tree shape.
    ///
    /// # Errors
    /// Propagates I/O or corruption errors pinning the root.
    pub fn root_height(&self) -> Result<u32> {
        let root_blocknum = self.header.read().root_blocknum;
        let root = CacheTable::get_and_pin(&self.cache, root_blocknum, PinMode::Read, true)?;
        Ok(root.read().height)
    }
}

fn new_internal_child(child_blocknum: BlockNum) -> crate::node::Partition {
    let mut p = crate::node::Partition::new_avail(PartitionPayload::Internal(crate::node::MessageBuffer::new()));
    p.child_blocknum = child_blocknum;
    p
}
