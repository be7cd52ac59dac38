//! Flush-to-child (spec.md §4.F "Flush to child": "moves every message
//! buffered against that child into the child itself, in ascending-MSN
//! order, then empties the parent's buffer for that child").
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/ft-flusher.c`
//! (`flush_this_child`), generalized over leaf vs. internal destinations
//! the way [`crate::tree::inject`] generalizes the insert path.

use crate::node::{Message, Node};

/// Drains `parent`'s buffer for partition `child_idx` and applies every
/// message to `child`, in the order the buffer stored them (ascending
/// MSN, by [`crate::node::MessageBuffer`]'s own invariant). Point messages
/// route by key; broadcasts replay into every one of `child`'s own
/// partitions. Does nothing if `child_idx` names a leaf partition on the
/// parent (nothing buffered there to flush) or is out of range.
pub fn flush_to_child(parent: &mut Node, child_idx: usize, child: &mut Node) -> usize {
    let Some(partition) = parent.children.get_mut(child_idx) else { return 0 };
    let Some(mb) = partition.message_buffer_mut() else { return 0 };
    let messages = mb.drain_all();
    partition.workdone = 0;
    let count = messages.len();
    for msg in messages {
        apply_to_child(child, &msg);
    }
    count
}

fn apply_to_child(child: &mut Node, msg: &Message) {
    let approx_size = msg.approx_size() as u64;
    if msg.is_broadcast() {
        for grandchild in &mut child.children {
            if let Some(basement) = grandchild.basement_mut() {
                basement.apply(msg);
            } else if let Some(mb) = grandchild.message_buffer_mut() {
                mb.push(msg.clone());
            }
            grandchild.workdone = grandchild.workdone.wrapping_add(approx_size);
        }
    } else {
        let idx = child.child_index_for_key(&msg.key);
        let grandchild = &mut child.children[idx];
        if let Some(basement) = grandchild.basement_mut() {
            basement.apply(msg);
        } else if let Some(mb) = grandchild.message_buffer_mut() {
            mb.push(msg.clone());
            grandchild.workdone = grandchild.workdone.wrapping_add(approx_size);
        }
    }
    child.dirty = true;
    child.max_msn_applied = std::cmp::max(child.max_msn_applied, msg.msn);
}
