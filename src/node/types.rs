//! The tree node data model (spec.md §3): `Node`, `Partition`, `MessageBuffer`,
//! `Basement`, `LeafEntry`, and the `Msn` sequence counter.
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/node.h` and
//! `ft/leafentry.h` for the shape of these structures, and on the
//! teacher's `recovery::wasp::tree::Node` for how an in-memory tree node
//! carries its own dirty/clock bookkeeping alongside its payload.

use crate::block::BlockNum;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;
/// External transaction identifier; opaque to this crate (owned by the
/// transaction manager, an external collaborator per spec.md §1).
pub type Xid = u64;

/// Message Sequence Number: 64-bit, strictly increasing per tree
/// (spec.md §3 `MSN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode)]
pub struct Msn(pub u64);

impl Msn {
    pub const ZERO: Msn = Msn(0);
}

/// Generates strictly increasing [`Msn`]s for one tree. `AtomicU64` rather
/// than a lock: MSN assignment must never block a concurrent reader
/// (spec.md §5 "MSNs are totally ordered per tree").
#[derive(Debug, Default)]
pub struct MsnGenerator {
    next: AtomicU64,
}

impl MsnGenerator {
    #[must_use]
    pub fn new(starting_at: Msn) -> Self {
        Self { next: AtomicU64::new(starting_at.0) }
    }

    pub fn next(&self) -> Msn {
        Msn(self.next.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn peek(&self) -> Msn {
        Msn(self.next.load(Ordering::Relaxed))
    }
}

/// A buffered mutation (spec.md §3 `MessageBuffer` entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Insert(Value),
    Delete,
    /// Applies to every key in the subtree rooted at the child the
    /// message is queued against; replayed into every child on flush
    /// rather than routed to one (spec.md §4.F "a broadcast-message list
    /// is replayed into every child").
    BroadcastDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msn: Msn,
    pub key: Key,
    pub kind: MessageKind,
    /// Nesting of transactions this message was issued under, outermost
    /// first, matching the leaf entry's provisional-record stack.
    pub xids: Vec<Xid>,
    /// True until the message has been applied to a basement or flushed
    /// further down the tree.
    pub fresh: bool,
}

impl Message {
    #[must_use]
    pub fn approx_size(&self) -> usize {
        let payload = match &self.kind {
            MessageKind::Insert(v) => v.len(),
            MessageKind::Delete | MessageKind::BroadcastDelete => 0,
        };
        self.key.len() + payload + self.xids.len() * 8 + 24
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self.kind, MessageKind::BroadcastDelete)
    }
}

/// Per-child message log for an internal node's partition (spec.md §3).
///
/// Invariant: `messages` is strictly increasing in `msn` (enforced by
/// [`MessageBuffer::push`], never by direct field access).
#[derive(Debug, Default, Clone)]
pub struct MessageBuffer {
    messages: Vec<Message>,
    broadcast_indices: Vec<usize>,
    fresh_index: BTreeMap<(Key, Msn), usize>,
    total_bytes: usize,
}

impl MessageBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg`.
    ///
    /// # Panics
    /// Panics if `msg.msn` does not strictly exceed every MSN already in
    /// the buffer: this is an engine-internal invariant violation, not a
    /// recoverable runtime condition (spec.md §3 "MSNs ... strictly
    /// monotone in insertion order").
    pub fn push(&mut self, msg: Message) {
        if let Some(last) = self.messages.last() {
            assert!(msg.msn > last.msn, "MessageBuffer::push: MSN must strictly increase");
        }
        self.total_bytes += msg.approx_size();
        let idx = self.messages.len();
        if msg.is_broadcast() {
            self.broadcast_indices.push(idx);
        } else if msg.fresh {
            self.fresh_index.insert((msg.key.clone(), msg.msn), idx);
        }
        self.messages.push(msg);
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in ascending-MSN (insertion) order, for delivery to a
    /// child buffer or basement (spec.md §4.F "delivered in ascending MSN").
    pub fn iter_ascending(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Removes and returns every message, ascending by MSN, emptying the
    /// buffer (spec.md §4.F "after flushing, the parent's buffer for
    /// child i is emptied").
    pub fn drain_all(&mut self) -> Vec<Message> {
        self.broadcast_indices.clear();
        self.fresh_index.clear();
        self.total_bytes = 0;
        std::mem::take(&mut self.messages)
    }

    /// Point messages for `key` not yet applied anywhere, oldest first.
    pub fn fresh_for_key<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a Message> + 'a {
        self.fresh_index
            .range((key.to_vec(), Msn::ZERO)..(key.to_vec(), Msn(u64::MAX)))
            .map(move |(_, &idx)| &self.messages[idx])
    }

    /// Broadcast messages in insertion order.
    pub fn broadcasts(&self) -> impl Iterator<Item = &Message> {
        self.broadcast_indices.iter().map(move |&idx| &self.messages[idx])
    }
}

/// One transaction's contribution to a key's MVCC chain (spec.md §3
/// `LeafEntry`: "each transaction record holds a TXNID and either a value
/// or a tombstone").
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxnRecord {
    pub xid: Xid,
    pub value: Option<Value>,
}

/// A leaf's value for one key (spec.md §3 `LeafEntry`).
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum LeafEntry {
    /// No open transaction has touched this key: a single value, no MVCC
    /// chain to walk (the fast path).
    Clean { value: Value },
    /// Committed records ordered newest-first, plus a nested stack of
    /// provisional records matching the open transaction nesting.
    Mvcc { committed: Vec<TxnRecord>, provisional: Vec<TxnRecord> },
}

impl LeafEntry {
    /// The value a reader with no open transaction of its own sees: the
    /// newest committed record, or the clean value.
    #[must_use]
    pub fn committed_value(&self) -> Option<&Value> {
        match self {
            LeafEntry::Clean { value } => Some(value),
            LeafEntry::Mvcc { committed, .. } => committed.first().and_then(|r| r.value.as_ref()),
        }
    }

    #[must_use]
    pub fn approx_size(&self) -> usize {
        match self {
            LeafEntry::Clean { value } => value.len() + 8,
            LeafEntry::Mvcc { committed, provisional } => {
                (committed.len() + provisional.len()) * 24
                    + committed.iter().chain(provisional).filter_map(|r| r.value.as_ref()).map(Vec::len).sum::<usize>()
            }
        }
    }
}

/// Per-leaf-child data partition (spec.md §3 `Basement`).
#[derive(Debug, Default, Clone)]
pub struct Basement {
    entries: BTreeMap<Key, LeafEntry>,
    pub max_msn_applied: Msn,
    pub seqinsert: u64,
    /// Messages from ancestor buffers already applied on-the-fly to this
    /// basement by a query, tracked so a later descent doesn't reapply
    /// them (spec.md §4.F "tracks ... to avoid re-application").
    pub stale_ancestor_messages_applied: u64,
}

impl Basement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&LeafEntry> {
        self.entries.get(key)
    }

    /// Inserts a previously-encoded entry without touching `max_msn_applied`
    /// or `seqinsert` — those are restored separately by the deserializer
    /// from the basement's own wire header, since a batch of restored
    /// entries doesn't carry individual MSNs the way a live `apply` does.
    pub fn restore_entry(&mut self, key: Key, entry: LeafEntry) {
        self.entries.insert(key, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &LeafEntry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.approx_size()).sum()
    }

    /// Applies `msg` to this basement, honoring the MSN monotonicity
    /// invariant (spec.md §3 `MSN`, §8 "applied at most once").
    ///
    /// Returns `false` without mutating anything if `msg.msn` has already
    /// been applied.
    pub fn apply(&mut self, msg: &Message) -> bool {
        if msg.msn <= self.max_msn_applied && self.max_msn_applied != Msn::ZERO {
            return false;
        }
        match &msg.kind {
            MessageKind::Insert(value) => {
                self.entries.insert(msg.key.clone(), LeafEntry::Clean { value: value.clone() });
            }
            MessageKind::Delete => {
                self.entries.remove(&msg.key);
            }
            MessageKind::BroadcastDelete => {
                self.entries.clear();
            }
        }
        self.max_msn_applied = msg.msn;
        self.seqinsert += 1;
        true
    }
}

/// The on-disk residency state of one partition (spec.md §3 `Partition.state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Invalid,
    OnDisk,
    Compressed,
    Avail,
}

/// A leaf or internal node's payload once resident (spec.md §3 `Partition.payload`).
#[derive(Debug, Clone)]
pub enum PartitionPayload {
    Internal(MessageBuffer),
    Leaf(Basement),
}

impl PartitionPayload {
    #[must_use]
    pub fn approx_size(&self) -> usize {
        match self {
            PartitionPayload::Internal(mb) => mb.total_bytes(),
            PartitionPayload::Leaf(b) => b.approx_size(),
        }
    }
}

/// One child slot of a node (spec.md §3 `Partition`).
#[derive(Debug, Clone)]
pub struct Partition {
    /// Only meaningful for internal nodes: the child this partition names.
    pub child_blocknum: BlockNum,
    /// Cumulative bytes of messages applied toward this child; drives the
    /// cleaner's and promote's flush heuristics.
    pub workdone: u64,
    pub state: PartitionState,
    /// Eviction clock bit. An `AtomicU64`-backed bit elsewhere (cache
    /// layer) touches this under shared locks per spec.md §9 REDESIGN
    /// FLAGS; the node's own copy is the authoritative value once the
    /// partition is loaded into the cache pair.
    pub clock_count: u8,
    /// Compressed bytes when `state == Compressed`; cleared otherwise.
    pub compressed: Option<Vec<u8>>,
    /// Resident payload when `state == Avail`; cleared otherwise.
    pub payload: Option<PartitionPayload>,
    /// Where this partition's sub-block lives on disk, once known.
    pub on_disk_offset: Option<u64>,
    pub on_disk_size: Option<u64>,
}

impl Partition {
    #[must_use]
    pub fn new_avail(payload: PartitionPayload) -> Self {
        Self {
            child_blocknum: BlockNum::NULL,
            workdone: 0,
            state: PartitionState::Avail,
            clock_count: 0,
            compressed: None,
            payload: Some(payload),
            on_disk_offset: None,
            on_disk_size: None,
        }
    }

    #[must_use]
    pub fn on_disk(offset: u64, size: u64, child_blocknum: BlockNum) -> Self {
        Self {
            child_blocknum,
            workdone: 0,
            state: PartitionState::OnDisk,
            clock_count: 0,
            compressed: None,
            payload: None,
            on_disk_offset: Some(offset),
            on_disk_size: Some(size),
        }
    }

    #[must_use]
    pub fn message_buffer(&self) -> Option<&MessageBuffer> {
        match &self.payload {
            Some(PartitionPayload::Internal(mb)) => Some(mb),
            _ => None,
        }
    }

    pub fn message_buffer_mut(&mut self) -> Option<&mut MessageBuffer> {
        match &mut self.payload {
            Some(PartitionPayload::Internal(mb)) => Some(mb),
            _ => None,
        }
    }

    #[must_use]
    pub fn basement(&self) -> Option<&Basement> {
        match &self.payload {
            Some(PartitionPayload::Leaf(b)) => Some(b),
            _ => None,
        }
    }

    pub fn basement_mut(&mut self) -> Option<&mut Basement> {
        match &mut self.payload {
            Some(PartitionPayload::Leaf(b)) => Some(b),
            _ => None,
        }
    }
}

/// A tree node: the unit cached and persisted (spec.md §3 `Node`).
#[derive(Debug, Clone)]
pub struct Node {
    pub blocknum: BlockNum,
    /// 0 for a leaf; internal nodes are `height >= 1`.
    pub height: u32,
    pub dirty: bool,
    pub layout_version: u32,
    /// `n_children - 1` keys partitioning the children's key ranges.
    pub pivots: Vec<Key>,
    pub children: Vec<Partition>,
    pub max_msn_applied: Msn,
}

impl Node {
    #[must_use]
    pub fn new_leaf(blocknum: BlockNum, layout_version: u32) -> Self {
        Self {
            blocknum,
            height: 0,
            dirty: true,
            layout_version,
            pivots: Vec::new(),
            children: vec![Partition::new_avail(PartitionPayload::Leaf(Basement::new()))],
            max_msn_applied: Msn::ZERO,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    #[must_use]
    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    /// Which child index a key routes to, per the pivot array.
    #[must_use]
    pub fn child_index_for_key(&self, key: &[u8]) -> usize {
        self.pivots.partition_point(|pivot| pivot.as_slice() <= key)
    }

    #[must_use]
    pub fn approx_size(&self) -> usize {
        let pivots: usize = self.pivots.iter().map(Vec::len).sum();
        let children: usize = self.children.iter().map(|p| p.payload.as_ref().map_or(0, PartitionPayload::approx_size)).sum();
        pivots + children + 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(msn: u64, key: &str, value: &str) -> Message {
        Message {
            msn: Msn(msn),
            key: key.as_bytes().to_vec(),
            kind: MessageKind::Insert(value.as_bytes().to_vec()),
            xids: Vec::new(),
            fresh: true,
        }
    }

    #[test]
    #[should_panic(expected = "strictly increase")]
    fn message_buffer_rejects_non_monotonic_msn() {
        let mut mb = MessageBuffer::new();
        mb.push(msg(5, "a", "1"));
        mb.push(msg(4, "b", "2"));
    }

    #[test]
    fn message_buffer_drain_is_ascending_and_empties() {
        let mut mb = MessageBuffer::new();
        mb.push(msg(1, "a", "1"));
        mb.push(msg(2, "b", "2"));
        let drained = mb.drain_all();
        assert_eq!(drained.iter().map(|m| m.msn.0).collect::<Vec<_>>(), vec![1, 2]);
        assert!(mb.is_empty());
    }

    #[test]
    fn basement_apply_is_idempotent_per_msn() {
        let mut b = Basement::new();
        let m = msg(10, "k", "v1");
        assert!(b.apply(&m));
        assert_eq!(b.get(b"k").unwrap().committed_value().unwrap(), b"v1");
        // Re-applying the same (already-seen) MSN must be a no-op.
        assert!(!b.apply(&m));
    }

    #[test]
    fn basement_insert_then_delete() {
        let mut b = Basement::new();
        b.apply(&msg(1, "k", "v1"));
        let del = Message { msn: Msn(2), key: b"k".to_vec(), kind: MessageKind::Delete, xids: Vec::new(), fresh: true };
        b.apply(&del);
        assert!(b.get(b"k").is_none());
    }

    #[test]
    fn msn_generator_strictly_increases() {
        let gen = MsnGenerator::new(Msn(1));
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
    }

    #[test]
    fn child_index_routes_by_pivot() {
        let mut node = Node::new_leaf(BlockNum::new(1), 26);
        node.pivots = vec![b"m".to_vec()];
        node.children.push(Partition::new_avail(PartitionPayload::Leaf(Basement::new())));
        assert_eq!(node.child_index_for_key(b"a"), 0);
        assert_eq!(node.child_index_for_key(b"z"), 1);
    }
}
