//! Component D: the node serializer (spec.md §4.D, §6 "Node on disk").
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/serialize/ft_node-serialize.cc`
//! (per-partition sub-blocks, each independently checksummed, node-info
//! sub-block carrying the pivot array and a directory so a partition can
//! be fetched without reading its neighbors) and on the teacher's
//! `recovery::wasp::page::Page`, which checksums a header-then-payload
//! layout the same way.
//!
//! Compression is an external collaborator excluded from this core
//! (spec.md §1); sub-blocks here always carry `compressed_size ==
//! uncompressed_size` (the identity "compressor"), leaving the format
//! ready for a real codec to slot in without changing the framing.

use crate::block::BlockNum;
use crate::checksum::checksum;
use crate::error::{Result, StoreError};
use crate::node::types::{Basement, Key, MessageBuffer, Node, Partition, PartitionPayload, PartitionState};
use bincode::config::standard;

const SUB_BLOCK_ALIGNMENT: usize = 512;

fn pad_to_alignment(buf: &mut Vec<u8>) {
    let rem = buf.len() % SUB_BLOCK_ALIGNMENT;
    if rem != 0 {
        buf.resize(buf.len() + (SUB_BLOCK_ALIGNMENT - rem), 0);
    }
}

/// Wraps `payload` in the on-disk sub-block framing: `{uncompressed_size:
/// u32, compressed_size: u32, checksum: u32, payload}`, then pads to a
/// 512-byte boundary (spec.md §6).
fn write_sub_block(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum(payload).to_le_bytes());
    out.extend_from_slice(payload);
    pad_to_alignment(&mut out);
    out
}

/// Reads one sub-block starting at `bytes[0..]`. Returns the validated
/// payload and the total number of bytes consumed (including alignment
/// padding), so the caller can advance to the next sub-block.
///
/// # Errors
/// Returns [`StoreError::Corruption`] on checksum mismatch, truncation,
/// or a `compressed_size` that disagrees with `uncompressed_size` (no
/// compression codec is wired in, so the two must match).
fn read_sub_block(bytes: &[u8]) -> Result<(Vec<u8>, usize)> {
    if bytes.len() < 12 {
        return Err(StoreError::Corruption("sub-block shorter than its own header".into()));
    }
    let uncompressed_size = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let compressed_size = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if compressed_size != uncompressed_size {
        return Err(StoreError::Corruption(
            "sub-block compressed_size != uncompressed_size with no compression codec configured".into(),
        ));
    }
    let crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    if bytes.len() < 12 + compressed_size {
        return Err(StoreError::Corruption("sub-block payload truncated".into()));
    }
    let payload = &bytes[12..12 + compressed_size];
    let actual = checksum(payload);
    if actual != crc {
        log::error!("sub-block checksum mismatch: expected {crc}, computed {actual}");
        return Err(StoreError::Corruption("sub-block checksum mismatch".into()));
    }
    let consumed = 12 + compressed_size;
    let rem = consumed % SUB_BLOCK_ALIGNMENT;
    let padded = if rem == 0 { consumed } else { consumed + (SUB_BLOCK_ALIGNMENT - rem) };
    Ok((payload.to_vec(), padded))
}

/// One entry in the node-info sub-block's partition directory: where
/// partition `i`'s sub-block begins, relative to the start of the node,
/// and its framed (post-padding) length.
#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
struct PartitionDirEntry {
    start_offset: u32,
    framed_len: u32,
    /// Only meaningful for internal nodes: which block the child this
    /// partition names lives at (spec.md §3 `Partition.child_blocknum`).
    /// `BlockNum::NULL` for a leaf's partitions, which have no child block.
    child_blocknum: u64,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct NodeInfoBody {
    layout_version: u32,
    height: u32,
    pivots: Vec<Key>,
    directory: Vec<PartitionDirEntry>,
}

/// Result of reading just the node-info sub-block: enough to build
/// `ON_DISK` partition placeholders without touching any partition's
/// payload (spec.md §4.D "each partition starts in state `ON_DISK`").
pub struct NodeInfo {
    pub layout_version: u32,
    pub height: u32,
    pub pivots: Vec<Key>,
    /// Partition `i`'s absolute file offset, framed length, and (for
    /// internal nodes) the blocknum of the child it names.
    pub partition_extents: Vec<(u64, u64, BlockNum)>,
    pub node_info_len: usize,
}

/// Serializes `node` into a byte buffer ready to write at an allocated
/// extent. Runs the basement-size rebalance pass first if `node` is a
/// leaf (spec.md §4.D "On serialize, a rebalance pass...").
///
/// # Errors
/// Propagates encode failures from `bincode`.
pub fn serialize_node(node: &mut Node, basement_size: u32) -> Result<Vec<u8>> {
    if node.is_leaf() {
        rebalance_basements(node, basement_size);
    }

    let mut partition_blocks = Vec::with_capacity(node.children.len());
    for child in &node.children {
        let payload = child
            .payload
            .as_ref()
            .ok_or_else(|| StoreError::Corruption("serialize_node: partition not resident".into()))?;
        let encoded = match payload {
            PartitionPayload::Internal(mb) => encode_message_buffer(mb)?,
            PartitionPayload::Leaf(b) => encode_basement(b)?,
        };
        partition_blocks.push(write_sub_block(&encoded));
    }

    let mut directory = Vec::with_capacity(partition_blocks.len());
    let mut running_offset = 0u32;
    for (block, child) in partition_blocks.iter().zip(&node.children) {
        directory.push(PartitionDirEntry {
            start_offset: running_offset,
            framed_len: block.len() as u32,
            child_blocknum: child.child_blocknum.as_u64(),
        });
        running_offset += block.len() as u32;
    }

    let info = NodeInfoBody {
        layout_version: node.layout_version,
        height: node.height,
        pivots: node.pivots.clone(),
        directory,
    };
    let info_bytes = bincode::encode_to_vec(&info, standard())?;
    let mut out = write_sub_block(&info_bytes);
    for block in partition_blocks {
        out.extend_from_slice(&block);
    }
    Ok(out)
}

fn encode_message_buffer(mb: &MessageBuffer) -> Result<Vec<u8>> {
    let messages: Vec<_> = mb.iter_ascending().cloned().collect();
    #[derive(bincode::Encode)]
    struct Wire<'a> {
        messages: &'a [crate::node::types::Message],
    }
    // Message isn't bincode-derivable directly (it holds a non-derive enum
    // payload type alias); encode field-by-field instead.
    let mut buf = Vec::new();
    buf.extend_from_slice(&(messages.len() as u32).to_be_bytes());
    for m in &messages {
        let kind_tag: u8 = match &m.kind {
            crate::node::types::MessageKind::Insert(_) => 0,
            crate::node::types::MessageKind::Delete => 1,
            crate::node::types::MessageKind::BroadcastDelete => 2,
        };
        buf.extend_from_slice(&m.msn.0.to_be_bytes());
        buf.extend_from_slice(&(m.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&m.key);
        buf.push(kind_tag);
        if let crate::node::types::MessageKind::Insert(v) = &m.kind {
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        buf.extend_from_slice(&(m.xids.len() as u32).to_be_bytes());
        for xid in &m.xids {
            buf.extend_from_slice(&xid.to_be_bytes());
        }
        buf.push(u8::from(m.fresh));
    }
    Ok(buf)
}

fn decode_message_buffer(bytes: &[u8]) -> Result<MessageBuffer> {
    use crate::node::types::{Message, MessageKind, Msn};
    let mut mb = MessageBuffer::new();
    let mut pos = 0usize;
    let read_u32 = |bytes: &[u8], pos: &mut usize| -> Result<u32> {
        if *pos + 4 > bytes.len() {
            return Err(StoreError::Corruption("message buffer truncated".into()));
        }
        let v = u32::from_be_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
        *pos += 4;
        Ok(v)
    };
    let count = read_u32(bytes, &mut pos)?;
    for _ in 0..count {
        if pos + 8 > bytes.len() {
            return Err(StoreError::Corruption("message buffer truncated".into()));
        }
        let msn = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let key_len = read_u32(bytes, &mut pos)? as usize;
        if pos + key_len > bytes.len() {
            return Err(StoreError::Corruption("message buffer key truncated".into()));
        }
        let key = bytes[pos..pos + key_len].to_vec();
        pos += key_len;
        if pos + 1 > bytes.len() {
            return Err(StoreError::Corruption("message buffer truncated".into()));
        }
        let kind_tag = bytes[pos];
        pos += 1;
        let kind = match kind_tag {
            0 => {
                let val_len = read_u32(bytes, &mut pos)? as usize;
                if pos + val_len > bytes.len() {
                    return Err(StoreError::Corruption("message buffer value truncated".into()));
                }
                let value = bytes[pos..pos + val_len].to_vec();
                pos += val_len;
                MessageKind::Insert(value)
            }
            1 => MessageKind::Delete,
            2 => MessageKind::BroadcastDelete,
            other => return Err(StoreError::Corruption(format!("unknown message kind tag {other}"))),
        };
        let xid_count = read_u32(bytes, &mut pos)?;
        let mut xids = Vec::with_capacity(xid_count as usize);
        for _ in 0..xid_count {
            if pos + 8 > bytes.len() {
                return Err(StoreError::Corruption("message buffer xid truncated".into()));
            }
            xids.push(u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }
        if pos + 1 > bytes.len() {
            return Err(StoreError::Corruption("message buffer truncated".into()));
        }
        let fresh = bytes[pos] != 0;
        pos += 1;
        mb.push(Message { msn: Msn(msn), key, kind, xids, fresh });
    }
    Ok(mb)
}

fn encode_basement(b: &Basement) -> Result<Vec<u8>> {
    #[derive(bincode::Encode)]
    struct Entry<'a> {
        key: &'a [u8],
        entry: &'a crate::node::types::LeafEntry,
    }
    let entries: Vec<Entry> = b.iter().map(|(k, v)| Entry { key: k, entry: v }).collect();
    #[derive(bincode::Encode)]
    struct Wire<'a> {
        max_msn_applied: u64,
        seqinsert: u64,
        stale_ancestor_messages_applied: u64,
        entries: Vec<Entry<'a>>,
    }
    let wire = Wire {
        max_msn_applied: b.max_msn_applied.0,
        seqinsert: b.seqinsert,
        stale_ancestor_messages_applied: b.stale_ancestor_messages_applied,
        entries,
    };
    Ok(bincode::encode_to_vec(&wire, standard())?)
}

fn decode_basement(bytes: &[u8]) -> Result<Basement> {
    #[derive(bincode::Decode)]
    struct Entry {
        key: Vec<u8>,
        entry: crate::node::types::LeafEntry,
    }
    #[derive(bincode::Decode)]
    struct Wire {
        max_msn_applied: u64,
        seqinsert: u64,
        stale_ancestor_messages_applied: u64,
        entries: Vec<Entry>,
    }
    let (wire, _): (Wire, usize) = bincode::decode_from_slice(bytes, standard())?;
    let mut basement = Basement::new();
    for entry in wire.entries {
        basement.restore_entry(entry.key, entry.entry);
    }
    basement.max_msn_applied = crate::node::types::Msn(wire.max_msn_applied);
    basement.seqinsert = wire.seqinsert;
    basement.stale_ancestor_messages_applied = wire.stale_ancestor_messages_applied;
    Ok(basement)
}

/// Reads just the node-info sub-block at the start of `bytes`, producing
/// `ON_DISK` partition placeholders (spec.md §4.D deserialization path).
///
/// # Errors
/// Returns [`StoreError::Corruption`] on a bad checksum or a directory
/// whose extents run past `bytes`.
pub fn read_node_info(bytes: &[u8], base_offset: u64) -> Result<NodeInfo> {
    let (payload, consumed) = read_sub_block(bytes)?;
    let (info, _): (NodeInfoBody, usize) = bincode::decode_from_slice(&payload, standard())?;
    let mut partition_extents = Vec::with_capacity(info.directory.len());
    for entry in &info.directory {
        let abs_offset = base_offset + consumed as u64 + entry.start_offset as u64;
        partition_extents.push((abs_offset, entry.framed_len as u64, BlockNum::new(entry.child_blocknum)));
    }
    Ok(NodeInfo {
        layout_version: info.layout_version,
        height: info.height,
        pivots: info.pivots,
        partition_extents,
        node_info_len: consumed,
    })
}

/// Decodes one partition's sub-block into its resident payload.
///
/// # Errors
/// Returns [`StoreError::Corruption`] on checksum or framing failure.
pub fn deserialize_partition(bytes: &[u8], is_leaf: bool) -> Result<PartitionPayload> {
    let (payload, _consumed) = read_sub_block(bytes)?;
    if is_leaf {
        Ok(PartitionPayload::Leaf(decode_basement(&payload)?))
    } else {
        Ok(PartitionPayload::Internal(decode_message_buffer(&payload)?))
    }
}

/// Builds an `ON_DISK` partition for slot `i` of a node whose node-info
/// has already been read.
#[must_use]
pub fn partition_placeholder(offset: u64, size: u64, child_blocknum: BlockNum) -> Partition {
    let mut p = Partition::on_disk(offset, size, child_blocknum);
    p.state = PartitionState::OnDisk;
    p
}

/// Repartitions a leaf's basements so that none exceeds `basement_size`
/// bytes (spec.md §4.D "a rebalance pass may repartition leaf basements").
///
/// This is a size-driven repack, distinct from [`crate::tree`]'s
/// pivot-driven split: it never changes tree height or creates a new
/// `BlockNum`, only how many basements one already-resident leaf node
/// carries.
pub fn rebalance_basements(node: &mut Node, basement_size: u32) {
    debug_assert!(node.is_leaf());
    let mut all_entries: Vec<(Key, crate::node::types::LeafEntry)> = Vec::new();
    for child in &node.children {
        if let Some(b) = child.basement() {
            all_entries.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    if all_entries.is_empty() {
        return;
    }
    all_entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut new_children = Vec::new();
    let mut new_pivots = Vec::new();
    let mut current = Basement::new();
    let mut current_bytes = 0usize;
    for (key, entry) in all_entries {
        let entry_size = key.len() + entry.approx_size();
        if current_bytes > 0 && current_bytes + entry_size > basement_size as usize {
            new_pivots.push(key.clone());
            new_children.push(Partition::new_avail(PartitionPayload::Leaf(std::mem::take(&mut current))));
            current_bytes = 0;
        }
        current_bytes += entry_size;
        current.restore_entry(key, entry);
    }
    new_children.push(Partition::new_avail(PartitionPayload::Leaf(current)));

    if new_children.len() > 1 {
        node.pivots = new_pivots;
        node.children = new_children;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::types::{LeafEntry, Message, MessageKind, Msn};

    fn leaf_with(entries: &[(&str, &str)]) -> Node {
        let mut node = Node::new_leaf(crate::block::BlockNum::new(1), 26);
        let b = node.children[0].basement_mut().unwrap();
        for (k, v) in entries {
            b.apply(&Message {
                msn: Msn(1),
                key: k.as_bytes().to_vec(),
                kind: MessageKind::Insert(v.as_bytes().to_vec()),
                xids: Vec::new(),
                fresh: true,
            });
        }
        node
    }

    #[test]
    fn leaf_node_round_trips() {
        let mut node = leaf_with(&[("alpha", "1"), ("beta", "2"), ("gamma", "3")]);
        let bytes = serialize_node(&mut node, 128 * 1024).unwrap();
        let info = read_node_info(&bytes, 0).unwrap();
        assert_eq!(info.height, 0);
        assert_eq!(info.partition_extents.len(), 1);
        let (offset, size, _) = info.partition_extents[0];
        let partition_bytes = &bytes[offset as usize..(offset + size) as usize];
        let payload = deserialize_partition(partition_bytes, true).unwrap();
        let PartitionPayload::Leaf(basement) = payload else { panic!("expected leaf payload") };
        assert_eq!(basement.get(b"alpha").unwrap().committed_value().unwrap(), b"1");
        assert_eq!(basement.get(b"beta").unwrap().committed_value().unwrap(), b"2");
        assert_eq!(basement.get(b"gamma").unwrap().committed_value().unwrap(), b"3");
    }

    #[test]
    fn rebalance_splits_oversized_basement() {
        let mut node = Node::new_leaf(crate::block::BlockNum::new(1), 26);
        let b = node.children[0].basement_mut().unwrap();
        for i in 0..200u32 {
            let k = format!("key{i:04}");
            b.apply(&Message {
                msn: Msn(u64::from(i) + 1),
                key: k.into_bytes(),
                kind: MessageKind::Insert(vec![0u8; 256]),
                xids: Vec::new(),
                fresh: true,
            });
        }
        rebalance_basements(&mut node, 4096);
        assert!(node.children.len() > 1);
        assert_eq!(node.pivots.len(), node.children.len() - 1);
        for child in &node.children {
            let size = child.basement().unwrap().approx_size();
            assert!(size <= 4096 + 300, "basement {size} exceeds target by more than one entry");
        }
    }

    #[test]
    fn corrupted_sub_block_checksum_is_detected() {
        let mut node = leaf_with(&[("k", "v")]);
        let mut bytes = serialize_node(&mut node, 128 * 1024).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let info = read_node_info(&bytes, 0).unwrap();
        let (offset, size, _) = info.partition_extents[0];
        let partition_bytes = &bytes[offset as usize..(offset + size) as usize];
        assert!(deserialize_partition(partition_bytes, true).is_err());
    }

    #[test]
    fn unused_leafentry_variant_is_exercised() {
        let entry = LeafEntry::Mvcc {
            committed: vec![crate::node::types::TxnRecord { xid: 1, value: Some(b"v".to_vec()) }],
            provisional: Vec::new(),
        };
        assert_eq!(entry.committed_value().unwrap(), b"v");
    }
}
