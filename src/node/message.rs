//! Ancestor message application (spec.md §4.F "a query descending through
//! the tree must apply, on-the-fly, any not-yet-flushed messages from
//! ancestor buffers whose key falls in the range being queried").
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/ft-ops.cc`
//! (`apply_ancestors_messages_to_bn`), generalized here into a function
//! over the types in [`crate::node::types`] rather than the original's
//! inline descent loop.

use crate::node::types::{Basement, Key, Message, MessageBuffer};

/// Applies every message in `ancestors` (ordered root-to-leaf) whose key
/// equals `key_hint` (when given) or which is a broadcast, to `basement`,
/// in ascending MSN order across all buffers combined.
///
/// `key_hint` narrows the scan to the single key a point query is after;
/// a range query passes `None` and applies broadcasts only, relying on
/// the caller to flush range-relevant point messages through the normal
/// flush path instead.
///
/// Returns the number of messages applied, which the caller adds to the
/// basement's `stale_ancestor_messages_applied` counter (spec.md §3
/// `Basement`).
pub fn apply_ancestor_messages(
    ancestors: &[&MessageBuffer],
    key_hint: Option<&Key>,
    basement: &mut Basement,
) -> u64 {
    let mut candidates: Vec<&Message> = Vec::new();
    for buffer in ancestors {
        candidates.extend(buffer.broadcasts());
        if let Some(key) = key_hint {
            candidates.extend(buffer.fresh_for_key(key));
        }
    }
    candidates.sort_by_key(|m| m.msn);
    let mut applied = 0u64;
    for msg in candidates {
        if basement.apply(msg) {
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::types::{MessageKind, Msn};

    fn insert(msn: u64, key: &str, value: &str) -> Message {
        Message {
            msn: Msn(msn),
            key: key.as_bytes().to_vec(),
            kind: MessageKind::Insert(value.as_bytes().to_vec()),
            xids: Vec::new(),
            fresh: true,
        }
    }

    #[test]
    fn ancestor_point_message_is_applied_on_the_fly() {
        let mut parent_buf = MessageBuffer::new();
        parent_buf.push(insert(5, "k", "from-ancestor"));
        let mut basement = Basement::new();
        let key = b"k".to_vec();
        let applied = apply_ancestor_messages(&[&parent_buf], Some(&key), &mut basement);
        assert_eq!(applied, 1);
        assert_eq!(basement.get(b"k").unwrap().committed_value().unwrap(), b"from-ancestor");
    }

    #[test]
    fn unrelated_keys_are_not_applied() {
        let mut parent_buf = MessageBuffer::new();
        parent_buf.push(insert(1, "other", "x"));
        let mut basement = Basement::new();
        let key = b"k".to_vec();
        let applied = apply_ancestor_messages(&[&parent_buf], Some(&key), &mut basement);
        assert_eq!(applied, 0);
        assert!(basement.get(b"k").is_none());
    }

    #[test]
    fn broadcast_messages_apply_regardless_of_key_hint() {
        let mut parent_buf = MessageBuffer::new();
        parent_buf.push(Message {
            msn: Msn(3),
            key: Vec::new(),
            kind: MessageKind::BroadcastDelete,
            xids: Vec::new(),
            fresh: true,
        });
        let mut basement = Basement::new();
        basement.apply(&insert(1, "k", "v"));
        let applied = apply_ancestor_messages(&[&parent_buf], None, &mut basement);
        assert_eq!(applied, 1);
        assert!(basement.get(b"k").is_none());
    }
}
