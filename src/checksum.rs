//! 32-bit non-cryptographic checksum primitive (a CRC32 polynomial
//! variant), used everywhere a sub-block, header slot, or block-table
//! entry needs an integrity check.

use crc32fast::Hasher;

/// Computes the checksum of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Computes the checksum over several byte slices in sequence, as if they
/// had been concatenated. Used where a structure's checksum covers a
/// header region plus a separately-owned payload buffer (e.g. a page's
/// header-then-data layout) without requiring the caller to copy them
/// together first.
#[must_use]
pub fn checksum_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
