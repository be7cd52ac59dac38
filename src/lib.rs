//! `bufftree`: the on-disk storage core of a write-optimized, transactional,
//! MVCC key-value index (a buffered fractal-tree B-tree).
//!
//! This crate is the persistence and concurrency substrate: tree nodes
//! with per-child message buffers and basements (`node`), a fixed-budget
//! concurrent page cache (`cache`), a first-fit block allocator and
//! crash-consistent block table (`block`), an alternating-slot file
//! header (`header`), pure tree mechanics (`tree`), and a checkpoint
//! protocol (`checkpoint`), tied together by the public `engine::Engine`
//! API.
//!
//! Excluded as external collaborators: the SQL/key-value API surface,
//! row-level locking, the write-ahead log and transaction manager, the
//! bulk loader, the compression codec, and comparison-function
//! registries. This crate only honors its documented contract with those
//! collaborators (`Engine::last_lsn`, `open`'s `max_acceptable_lsn`).

#![forbid(unsafe_code)]

pub mod block;
pub mod cache;
pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod header;
pub mod logger;
pub mod node;
pub mod tree;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Result, StoreError};
