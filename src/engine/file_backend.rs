//! The on-disk [`CacheFile`] implementation: the one concrete file a
//! [`crate::cache::CacheTable`] drives a node's lifecycle through (spec.md
//! §4.E, §6 "Node on disk").
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/cachetable/cachetable.cc`
//! (the cachefile's fetch/flush/partial-fetch callbacks) and on the
//! teacher's `recovery::wasp::wasp_engine::FileEngine`, which owns the same
//! `file + block table + config` triple behind one `Send + Sync` type.

use crate::block::{BlockNum, BlockTable, BlockTranslation, View};
use crate::cache::{CacheFile, CacheTable, PartialEvictionCost};
use crate::checksum::checksum;
use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::node::{
    deserialize_partition, partition_placeholder, read_node_info, serialize_node, Node,
    PartitionPayload, PartitionState,
};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Weak};

/// Backs one open file: owns the `File` handle and the block table that
/// maps blocknums to byte ranges within it.
pub struct FileBacking {
    file: Mutex<std::fs::File>,
    block_table: Arc<RwLock<BlockTable>>,
    config: EngineConfig,
    /// Back-reference to the cache table this file backs, so
    /// [`CacheFile::cleaner`] can pin and flush a child through the same
    /// table its own node lives in. Set once, after the table is built
    /// (the two are mutually referential: the table needs this file to
    /// exist first). `Weak` so the cycle doesn't leak either side.
    cache: OnceCell<Weak<CacheTable<FileBacking>>>,
}

impl FileBacking {
    #[must_use]
    pub fn new(file: std::fs::File, block_table: Arc<RwLock<BlockTable>>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { file: Mutex::new(file), block_table, config, cache: OnceCell::new() })
    }

    /// Wires up the back-reference to the cache table this file backs.
    ///
    /// # Panics
    /// Panics if called twice: the back-reference is set exactly once, at
    /// engine construction time.
    pub fn set_cache_table(&self, cache: Weak<CacheTable<FileBacking>>) {
        self.cache.set(cache).ok().expect("FileBacking::set_cache_table called more than once");
    }

    fn cache_table(&self) -> Option<Arc<CacheTable<FileBacking>>> {
        self.cache.get().and_then(Weak::upgrade)
    }

    fn read_bytes(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Builds a [`Node`] from its on-disk bytes without decoding any
    /// partition payload: every child starts `ON_DISK` (spec.md §4.D
    /// "each partition starts in state `ON_DISK`"), and is only
    /// transitioned to `AVAIL` by [`Self::partial_fetch`] when a caller
    /// actually needs it.
    fn build_node(blocknum: BlockNum, bytes: &[u8], base_offset: u64) -> Result<Node> {
        let info = read_node_info(bytes, base_offset)?;
        let mut children = Vec::with_capacity(info.partition_extents.len());
        for &(offset, size, child_blocknum) in &info.partition_extents {
            let rel_end = (offset - base_offset) as usize + size as usize;
            if rel_end > bytes.len() {
                return Err(StoreError::Corruption(format!(
                    "node {blocknum:?}: partition extent runs past its own node bytes"
                )));
            }
            children.push(partition_placeholder(offset, size, child_blocknum));
        }
        Ok(Node {
            blocknum,
            height: info.height,
            dirty: false,
            layout_version: info.layout_version,
            pivots: info.pivots,
            children,
            max_msn_applied: crate::node::Msn::ZERO,
        })
    }

    /// Serializes `node` and writes it at a freshly allocated extent in
    /// `view`. When `free_old_immediately` is false (checkpoint clones
    /// writing against [`View::InProgress`]), the extent the translation
    /// previously occupied in that view is left allocated; the checkpoint
    /// protocol reclaims it once the rewrite is published (spec.md §4.G).
    fn write_node_to_view(
        &self,
        blocknum: BlockNum,
        node: &Node,
        view: View,
        free_old_immediately: bool,
    ) -> Result<BlockTranslation> {
        let mut working = node.clone();
        let bytes = serialize_node(&mut working, self.config.basement_size)?;
        if bytes.len() as u64 > self.config.nodesize as u64 * 2 {
            log::warn!(
                "{blocknum:?} serialized to {} bytes, more than double the configured nodesize {}",
                bytes.len(),
                self.config.nodesize
            );
        }
        let crc = checksum(&bytes);

        let old = self.block_table.read().get(view, blocknum).ok();
        let translation = self.block_table.write().assign_new_extent(view, blocknum, bytes.len() as u64, crc)?;

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(translation.offset))?;
            file.write_all(&bytes)?;
        }

        if free_old_immediately {
            if let Some(old) = old {
                if old.offset != translation.offset {
                    self.block_table.write().allocator_mut().free(old.offset)?;
                }
            }
        }
        Ok(translation)
    }

    /// Writes `node` against [`View::InProgress`] for a checkpoint clone,
    /// without touching [`View::Current`] or freeing the translation's
    /// previous extent (spec.md §4.G step 2; see
    /// [`crate::checkpoint::write_pending`]).
    ///
    /// # Errors
    /// Propagates I/O or encode failures.
    pub fn write_checkpoint_clone(&self, blocknum: BlockNum, node: &Node) -> Result<()> {
        self.write_node_to_view(blocknum, node, View::InProgress, false)?;
        Ok(())
    }
}

impl CacheFile for FileBacking {
    fn fetch(&self, blocknum: BlockNum) -> Result<(Node, usize)> {
        let translation = self.block_table.read().get(View::Current, blocknum)?;
        let bytes = self.read_bytes(translation.offset, translation.size)?;
        if checksum(&bytes) != translation.checksum {
            return Err(StoreError::Corruption(format!(
                "node {blocknum:?}: checksum mismatch on fetch"
            )));
        }
        let node = Self::build_node(blocknum, &bytes, translation.offset)?;
        let size = node.approx_size();
        Ok((node, size))
    }

    fn partial_fetch_required(&self, node: &Node) -> bool {
        node.children.iter().any(|c| c.state != PartitionState::Avail)
    }

    fn partial_fetch(&self, node: &mut Node) -> Result<()> {
        let is_leaf = node.is_leaf();
        for child in &mut node.children {
            if child.state == PartitionState::Avail {
                continue;
            }
            let (Some(offset), Some(size)) = (child.on_disk_offset, child.on_disk_size) else {
                return Err(StoreError::Corruption(
                    "partial_fetch: non-resident partition has no recorded on-disk location".into(),
                ));
            };
            let bytes = self.read_bytes(offset, size)?;
            let payload = deserialize_partition(&bytes, is_leaf)?;
            child.payload = Some(payload);
            child.compressed = None;
            child.state = PartitionState::Avail;
        }
        Ok(())
    }

    fn flush(&self, blocknum: BlockNum, node: &Node, _keep_me: bool) -> Result<()> {
        self.write_node_to_view(blocknum, node, View::Current, true)?;
        Ok(())
    }

    fn pe_est(&self, node: &Node) -> PartialEvictionCost {
        if node.children.iter().all(|c| c.state != PartitionState::Avail) {
            return PartialEvictionCost::Nothing;
        }
        if node.is_leaf() {
            PartialEvictionCost::Expensive
        } else {
            PartialEvictionCost::Cheap
        }
    }

    fn pe(&self, node: &mut Node) -> usize {
        let mut freed = 0usize;
        for child in &mut node.children {
            if child.state != PartitionState::Avail {
                continue;
            }
            if child.on_disk_offset.is_none() {
                // Never serialized yet (dirty, newborn): dropping it now
                // would lose data with nowhere to re-fetch it from.
                continue;
            }
            let size = child.payload.as_ref().map_or(0, PartitionPayload::approx_size);
            child.payload = None;
            child.state = PartitionState::OnDisk;
            freed += size;
        }
        freed
    }

    fn cleaner(&self, node: &mut Node) -> Result<()> {
        if node.is_leaf() {
            return Ok(());
        }
        if self.partial_fetch_required(node) {
            self.partial_fetch(node)?;
        }
        let Some((child_idx, _)) =
            node.children.iter().enumerate().max_by_key(|(_, c)| c.workdone)
        else {
            return Ok(());
        };
        if node.children[child_idx].workdone == 0 {
            return Ok(());
        }
        let child_blocknum = node.children[child_idx].child_blocknum;
        if child_blocknum.is_null() {
            return Ok(());
        }
        let Some(table) = self.cache_table() else { return Ok(()) };
        let pinned = CacheTable::get_and_pin(
            &table,
            child_blocknum,
            crate::cache::PinMode::WriteExpensive,
            true,
        )?;
        if self.partial_fetch_required(&pinned.read()) {
            let mut w = pinned.write();
            self.partial_fetch(&mut w)?;
        }
        {
            let mut child = pinned.write();
            crate::tree::flush_to_child(node, child_idx, &mut child);
            child.dirty = true;
        }
        pinned.mark_dirty();
        Ok(())
    }

    fn clone_for_checkpoint(&self, node: &Node) -> Node {
        node.clone()
    }

    fn checkpoint_complete(&self, _blocknum: BlockNum) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockAllocator;
    use crate::config::{EngineConfig, TOTAL_HEADER_RESERVE};
    use crate::node::{Message, MessageKind, Msn};

    fn scratch_file() -> std::fs::File {
        tempfile::tempfile().expect("tempfile")
    }

    fn backing() -> Arc<FileBacking> {
        let allocator = BlockAllocator::create(TOTAL_HEADER_RESERVE, 4096);
        let block_table = Arc::new(RwLock::new(BlockTable::create(allocator)));
        FileBacking::new(scratch_file(), block_table, EngineConfig::tiny())
    }

    #[test]
    fn flush_then_fetch_round_trips_a_leaf_node() {
        let backing = backing();
        let blocknum = backing.block_table.write().allocate_new();
        let mut node = Node::new_leaf(blocknum, 26);
        node.children[0].basement_mut().unwrap().apply(&Message {
            msn: Msn(1),
            key: b"k".to_vec(),
            kind: MessageKind::Insert(b"v".to_vec()),
            xids: Vec::new(),
            fresh: true,
        });

        backing.flush(blocknum, &node, true).unwrap();
        let (mut fetched, _) = backing.fetch(blocknum).unwrap();
        assert!(backing.partial_fetch_required(&fetched), "a freshly fetched node starts ON_DISK");
        backing.partial_fetch(&mut fetched).unwrap();
        assert!(!backing.partial_fetch_required(&fetched));
        assert_eq!(
            fetched.children[0].basement().unwrap().get(b"k").unwrap().committed_value().unwrap(),
            b"v"
        );
    }

    #[test]
    fn second_flush_frees_the_first_extent() {
        let backing = backing();
        let blocknum = backing.block_table.write().allocate_new();
        let node = Node::new_leaf(blocknum, 26);
        backing.flush(blocknum, &node, true).unwrap();
        let first = backing.block_table.read().get(View::Current, blocknum).unwrap();
        backing.flush(blocknum, &node, true).unwrap();
        let second = backing.block_table.read().get(View::Current, blocknum).unwrap();
        assert!(backing.block_table.read().allocator().size_at(first.offset).is_err() || first.offset == second.offset);
    }

    #[test]
    fn pe_drops_resident_partition_to_on_disk() {
        let backing = backing();
        let blocknum = backing.block_table.write().allocate_new();
        let node = Node::new_leaf(blocknum, 26);
        backing.flush(blocknum, &node, true).unwrap();
        let (mut fetched, _) = backing.fetch(blocknum).unwrap();
        backing.partial_fetch(&mut fetched).unwrap();
        let freed = backing.pe(&mut fetched);
        assert!(freed > 0 || fetched.children[0].basement().unwrap().is_empty());
        assert!(fetched.children[0].state == PartitionState::OnDisk);
    }

    #[test]
    fn checkpoint_clone_write_does_not_disturb_current_view() {
        let backing = backing();
        let blocknum = backing.block_table.write().allocate_new();
        let node = Node::new_leaf(blocknum, 26);
        backing.flush(blocknum, &node, true).unwrap();
        let before = backing.block_table.read().get(View::Current, blocknum).unwrap();
        backing.write_checkpoint_clone(blocknum, &node).unwrap();
        let after = backing.block_table.read().get(View::Current, blocknum).unwrap();
        assert_eq!(before, after);
        assert!(backing.block_table.read().get(View::InProgress, blocknum).is_ok());
    }
}
