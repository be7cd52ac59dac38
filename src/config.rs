//! Tunables for the storage engine core.
//!
//! Shaped like the teacher's `cache::config::CacheConfig`: one struct, a
//! `Default` impl with the spec's documented defaults, plain fields the
//! engine reads at the relevant decision points rather than a builder.

/// Alignment (bytes) that every block-allocator extent is a multiple of
/// (spec.md §6 `BLOCK_ALLOCATOR_ALIGNMENT`).
pub const BLOCK_ALLOCATOR_ALIGNMENT: u64 = 4096;

/// Size (bytes) of one header slot; two slots are reserved at the start of
/// the file (spec.md §4.C, §6 `HEADER_RESERVE`).
pub const HEADER_RESERVE: u64 = 4096;

/// Total reserved region at the start of the file: two header slots.
pub const TOTAL_HEADER_RESERVE: u64 = 2 * HEADER_RESERVE;

/// Current on-disk layout version written by this build.
pub const CURRENT_LAYOUT_VERSION: u32 = 26;

/// Oldest layout version this build will still open (spec.md §7 `TOO_OLD`).
pub const MIN_SUPPORTED_LAYOUT_VERSION: u32 = 24;

/// Big-endian magic stamped at the start of every header slot (spec.md §6).
pub const FILE_MAGIC: [u8; 8] = *b"tokudata";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Target total size (bytes) of a serialized node (spec.md §4.D).
    /// Default 4 MiB.
    pub nodesize: u32,
    /// Target size (bytes) of one leaf partition/basement (spec.md §4.D).
    /// Default 128 KiB.
    pub basement_size: u32,
    /// Fan-out target used by the reactivity heuristics (§4.F) and stamped
    /// into the header for diagnostics.
    pub fanout_target: u32,
    /// Byte budget enforced by the page cache (§4.E).
    pub cache_budget_bytes: u64,
    /// How many levels `promote` will recurse before stopping and
    /// recording a `depth_bound` stat (§4.F "promotion stops after depth 3
    /// by default").
    pub max_promote_depth: u32,
    /// Period between cleaner-thread sweeps (§4.E).
    pub cleaner_period: std::time::Duration,
    /// Number of internal nodes the cleaner considers per sweep.
    pub cleaner_iterations: u32,
    /// Alignment used by the block allocator. Must be >= 512 and a
    /// multiple of 512 (spec.md §4.A).
    pub alignment: u64,
    /// Bytes reserved at the start of the file (header region), unavailable
    /// for allocation.
    pub reserve_at_start: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nodesize: 4 * 1024 * 1024,
            basement_size: 128 * 1024,
            fanout_target: 16,
            cache_budget_bytes: 128 * 1024 * 1024,
            max_promote_depth: 3,
            cleaner_period: std::time::Duration::from_secs(1),
            cleaner_iterations: 5,
            alignment: BLOCK_ALLOCATOR_ALIGNMENT,
            reserve_at_start: TOTAL_HEADER_RESERVE,
        }
    }
}

impl EngineConfig {
    /// A config tuned for tests: tiny nodes so split/merge/eviction paths
    /// are exercised without generating megabytes of fixture data.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            nodesize: 64 * 1024,
            basement_size: 8 * 1024,
            fanout_target: 4,
            cache_budget_bytes: 256 * 1024,
            ..Self::default()
        }
    }
}
