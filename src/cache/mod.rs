//! The page cache ("cachetable"): the capability trait lives in `file`,
//! the per-entry lock in `pair`, the table itself (lookup/pin/evict/
//! checkpoint) in `table`, the background cleaner thread's lifecycle in
//! `cleaner`, and counters in `metrics`.

mod cleaner;
mod file;
mod metrics;
mod pair;
mod table;

pub use cleaner::CleanerHandle;
pub use file::{CacheFile, PartialEvictionCost};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use pair::{CachePair, FileId, PairKey, PinMode};
pub use table::{CacheTable, PinnedPair, PinnedWriteGuard};
