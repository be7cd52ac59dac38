//! Component D's data model glue (spec.md §3–§4.D): the node/partition/
//! message-buffer/basement types, the node serializer, and ancestor-message
//! application, grouped and re-exported the way the teacher groups
//! `recovery::wasp::{page, tree, types}` behind `recovery::wasp::mod`.

mod message;
mod serializer;
mod types;

pub use message::apply_ancestor_messages;
pub use serializer::{
    deserialize_partition, partition_placeholder, rebalance_basements, read_node_info,
    serialize_node, NodeInfo,
};
pub use types::{
    Basement, Key, LeafEntry, Message, MessageBuffer, MessageKind, Msn, MsnGenerator, Node,
    Partition, PartitionPayload, PartitionState, TxnRecord, Value, Xid,
};
