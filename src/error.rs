//! Crate-wide error taxonomy (spec.md §7).
//!
//! Mirrors the teacher's `thiserror`-based `DbError` (see
//! `saviornt-NexusLite/src/utils/errors.rs`): one flat enum, `#[from]` for
//! the I/O and codec errors that cross every on-disk boundary, plain
//! string payloads for the error codes the spec calls out by name.

use thiserror::Error;

/// Errors surfaced by the storage engine core.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Short read/write, OS error, or other I/O failure. Propagated; a
    /// checkpoint that hits this aborts without touching in-memory state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sub-block or structure failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// A sub-block or structure failed to encode.
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Checksum mismatch, bad magic, an overlapping extent, or any other
    /// state the engine cannot have reached without on-disk corruption.
    /// Per spec.md §7 this is fatal: the allocator aborts the process,
    /// every other component fails the operation.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Header accepted neither slot at open time: the candidate is older
    /// than what the caller will accept.
    #[error("header too old: on-disk checkpoint_lsn is below the caller's floor")]
    TooOld,

    /// Header accepted neither slot at open time: the candidate's layout
    /// version is newer than this build understands.
    #[error("header too new: layout_version exceeds what this build supports")]
    TooNew,

    /// Neither header slot validated (bad checksum, bad magic, or truncated
    /// file).
    #[error("no valid header found")]
    NoHeader,

    /// A non-blocking acquire could not proceed; caller releases held pins
    /// and reissues the operation from a higher level (spec.md §5).
    #[error("try again: pair is held in a conflicting mode")]
    TryAgain,

    /// The cache's configured byte budget was exceeded by more than
    /// eviction could recover synchronously; indicates misconfiguration.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// `get_and_pin` found no entry and no fetch callback could produce one
    /// (e.g. the backing blocknum was never allocated).
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was interrupted via the caller's cancellation hook.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StoreError>;
