//! Reactivity classification (spec.md §4.F "Reactivity states per node").
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/ft-flusher.c`
//! (`get_flush_status`/`ft_node_needs_rebalance`-style threshold checks)
//! generalized here into one pure function over [`Node`] and
//! [`EngineConfig`], since the original inlines these checks at each call
//! site.

use crate::config::EngineConfig;
use crate::node::Node;

/// A node's current shape classification (spec.md §3 `Partition.state`
/// companion concept, §4.F "Reactivity").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivity {
    /// No action needed.
    Stable,
    /// At least one child buffer is gorged: a flush should run before
    /// more messages are injected into it.
    Flushable,
    /// Total serialized size exceeds `nodesize`: should split.
    Splittable,
    /// Total serialized size is small enough that merging with a sibling
    /// would still fit under `nodesize`.
    Mergeable,
}

/// A child buffer is "gorged" once it holds more than this fraction of
/// `nodesize` worth of unflushed messages (spec.md GLOSSARY "Gorged").
const GORGE_FRACTION_NUM: u64 = 1;
const GORGE_FRACTION_DEN: u64 = 4;

/// True if `node`'s child `child_idx` buffer exceeds its flush threshold
/// (spec.md §4.F "the child-buffer would exceed its size budget
/// ('gorged')").
#[must_use]
pub fn is_child_gorged(node: &Node, child_idx: usize, cfg: &EngineConfig) -> bool {
    let Some(mb) = node.children.get(child_idx).and_then(|c| c.message_buffer()) else {
        return false;
    };
    let threshold = u64::from(cfg.nodesize) * GORGE_FRACTION_NUM / GORGE_FRACTION_DEN;
    mb.total_bytes() as u64 > threshold
}

/// Classifies `node`'s reactivity against `cfg`'s thresholds (spec.md
/// §4.F). Splittable takes priority over flushable, which takes priority
/// over mergeable, matching the original's "split before you flush
/// further into an oversized node" ordering.
#[must_use]
pub fn reactivity(node: &Node, cfg: &EngineConfig) -> Reactivity {
    let size = node.approx_size() as u64;
    if size > u64::from(cfg.nodesize) {
        return Reactivity::Splittable;
    }
    if !node.is_leaf() && (0..node.n_children()).any(|i| is_child_gorged(node, i, cfg)) {
        return Reactivity::Flushable;
    }
    // A node is mergeable once it is small enough that combining it with
    // a neighbor would still fit under nodesize, leaving headroom so the
    // merge doesn't immediately need to split back apart.
    if node.n_children() > 1 && size < u64::from(cfg.nodesize) / 4 {
        return Reactivity::Mergeable;
    }
    Reactivity::Stable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockNum;
    use crate::node::{Message, MessageKind, Msn, PartitionPayload};

    #[test]
    fn empty_leaf_is_stable() {
        let node = Node::new_leaf(BlockNum::new(1), 26);
        let cfg = EngineConfig::tiny();
        assert_eq!(reactivity(&node, &cfg), Reactivity::Stable);
    }

    #[test]
    fn oversized_leaf_is_splittable() {
        let mut node = Node::new_leaf(BlockNum::new(1), 26);
        let b = node.children[0].basement_mut().unwrap();
        for i in 0..1000u32 {
            b.apply(&Message {
                msn: Msn(u64::from(i) + 1),
                key: format!("k{i:05}").into_bytes(),
                kind: MessageKind::Insert(vec![0u8; 256]),
                xids: Vec::new(),
                fresh: true,
            });
        }
        let cfg = EngineConfig::tiny();
        assert_eq!(reactivity(&node, &cfg), Reactivity::Splittable);
    }

    #[test]
    fn gorged_child_buffer_is_flushable() {
        let mut node = Node::new_leaf(BlockNum::new(1), 26);
        node.height = 1;
        node.children[0].payload = Some(PartitionPayload::Internal(crate::node::MessageBuffer::new()));
        let mb = node.children[0].message_buffer_mut().unwrap();
        for i in 0..300u32 {
            mb.push(Message {
                msn: Msn(u64::from(i) + 1),
                key: format!("k{i:05}").into_bytes(),
                kind: MessageKind::Insert(vec![0u8; 64]),
                xids: Vec::new(),
                fresh: true,
            });
        }
        let cfg = EngineConfig::tiny();
        assert_eq!(reactivity(&node, &cfg), Reactivity::Flushable);
    }
}
