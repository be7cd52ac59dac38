//! Component C: the file header (spec.md §4.C).
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/ft.cc`
//! (`toku_serialize_ft_to`/`deserialize_ft_from_fd_into_rbuf`, the two
//! alternating header slots selected by `checkpoint_count` parity) and on
//! the teacher's `recovery::wasp::manifest::Manifest`, which uses the
//! identical alternating-slot trick for its own versioned root pointer.

use crate::block::BlockNum;
use crate::checksum::checksum;
use crate::config::{FILE_MAGIC, HEADER_RESERVE, MIN_SUPPORTED_LAYOUT_VERSION};
use crate::error::{Result, StoreError};

/// One of the two 4096-byte slots reserved at the start of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub layout_version: u32,
    pub build_id: u32,
    /// Monotonically increasing; which slot is "current" is
    /// `checkpoint_count % 2` (spec.md §4.C).
    pub checkpoint_count: u64,
    /// Highest LSN known durable as of this checkpoint (§6 contract with
    /// the external WAL/txn manager).
    pub checkpoint_lsn: u64,
    pub root_blocknum: BlockNum,
    pub nodesize: u32,
    pub basement_size: u32,
    pub compression_method: u8,
    pub fanout_target: u32,
    /// Where the block translation table itself lives.
    pub translation_loc: u64,
    pub translation_size: u64,
    /// Diagnostic counters carried across checkpoints (§4.C "stats").
    pub key_count_estimate: u64,
    pub val_size_estimate: u64,
}

impl FileHeader {
    /// Builds the first header a freshly created file gets: checkpoint
    /// count 0, no root yet (`BlockNum::NULL`), current layout version.
    #[must_use]
    pub fn new_empty(
        layout_version: u32,
        build_id: u32,
        nodesize: u32,
        basement_size: u32,
        fanout_target: u32,
    ) -> Self {
        Self {
            magic: FILE_MAGIC,
            layout_version,
            build_id,
            checkpoint_count: 0,
            checkpoint_lsn: 0,
            root_blocknum: BlockNum::NULL,
            nodesize,
            basement_size,
            compression_method: 0,
            fanout_target,
            translation_loc: 0,
            translation_size: 0,
            key_count_estimate: 0,
            val_size_estimate: 0,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Serializes this header into a `HEADER_RESERVE`-byte slot: checksum
    /// over the encoded body, then `[checksum:4][body_len:4][body][zero padding]`.
    ///
    /// # Errors
    /// Returns [`StoreError::Corruption`] if the encoded body doesn't fit
    /// in one slot.
    pub fn write_slot(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let reserve = HEADER_RESERVE as usize;
        if body.len() + 8 > reserve {
            return Err(StoreError::Corruption(format!(
                "header body of {} bytes does not fit in a {reserve}-byte slot",
                body.len()
            )));
        }
        let mut slot = Vec::with_capacity(reserve);
        let crc = checksum(&body);
        slot.extend_from_slice(&crc.to_be_bytes());
        slot.extend_from_slice(&(body.len() as u32).to_be_bytes());
        slot.extend_from_slice(&body);
        slot.resize(reserve, 0);
        Ok(slot)
    }

    /// Parses one `HEADER_RESERVE`-byte slot, validating its checksum and
    /// magic.
    ///
    /// # Errors
    /// Returns [`StoreError::NoHeader`] if the checksum, length, or magic
    /// don't check out: a slot in this state is simply "absent," not
    /// necessarily corrupt (e.g. a freshly-zeroed file).
    pub fn read_slot(slot: &[u8]) -> Result<Self> {
        if slot.len() < 8 {
            return Err(StoreError::NoHeader);
        }
        let crc = u32::from_be_bytes(slot[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(slot[4..8].try_into().unwrap()) as usize;
        if 8 + len > slot.len() {
            return Err(StoreError::NoHeader);
        }
        let body = &slot[8..8 + len];
        if checksum(body) != crc {
            return Err(StoreError::NoHeader);
        }
        let (header, _): (FileHeader, usize) =
            bincode::decode_from_slice(body, bincode::config::standard())
                .map_err(|_| StoreError::NoHeader)?;
        if header.magic != FILE_MAGIC {
            return Err(StoreError::NoHeader);
        }
        Ok(header)
    }

    /// Byte offset of this header's slot (0 or 1) within the file.
    #[must_use]
    pub fn slot_offset_for_checkpoint_count(checkpoint_count: u64) -> u64 {
        (checkpoint_count % 2) * HEADER_RESERVE
    }
}

/// Selects which of two candidate headers is current and validates it
/// against the caller's acceptance window (spec.md §4.C, §7 `TooOld`/`TooNew`).
///
/// `max_acceptable_lsn` is a *cap*, not a floor: a slot whose
/// `checkpoint_lsn` exceeds it describes a checkpoint the caller's WAL/txn
/// manager hasn't replayed up to yet, so it is passed over in favor of the
/// other slot (if that one qualifies) rather than automatically winning.
/// This is what lets a caller reopen "as of" an earlier checkpoint's LSN
/// (spec.md §8 scenario 4) instead of always getting the newest slot.
///
/// # Errors
/// - [`StoreError::NoHeader`] if neither slot parses.
/// - [`StoreError::TooOld`] if the only parseable slot(s) have a
///   `layout_version` below [`MIN_SUPPORTED_LAYOUT_VERSION`].
/// - [`StoreError::TooNew`] if a slot's `layout_version` exceeds
///   `max_supported_layout_version`, or if every parseable slot's
///   `checkpoint_lsn` exceeds `max_acceptable_lsn`.
pub fn choose_current(
    slot0: Option<FileHeader>,
    slot1: Option<FileHeader>,
    max_acceptable_lsn: u64,
    max_supported_layout_version: u32,
) -> Result<FileHeader> {
    if slot0.is_none() && slot1.is_none() {
        log::error!("neither header slot parsed");
        return Err(StoreError::NoHeader);
    }

    for h in [slot0, slot1].into_iter().flatten() {
        if h.layout_version < MIN_SUPPORTED_LAYOUT_VERSION {
            log::error!(
                "header layout_version {} is below min supported {MIN_SUPPORTED_LAYOUT_VERSION}",
                h.layout_version
            );
            return Err(StoreError::TooOld);
        }
        if h.layout_version > max_supported_layout_version {
            log::error!(
                "header layout_version {} exceeds max supported {max_supported_layout_version}",
                h.layout_version
            );
            return Err(StoreError::TooNew);
        }
    }

    let winner = [slot0, slot1]
        .into_iter()
        .flatten()
        .filter(|h| h.checkpoint_lsn <= max_acceptable_lsn)
        .max_by_key(|h| h.checkpoint_count);

    match winner {
        Some(h) => Ok(h),
        None => {
            log::error!(
                "no header slot has checkpoint_lsn <= max_acceptable_lsn {max_acceptable_lsn}"
            );
            Err(StoreError::TooNew)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileHeader {
        let mut h = FileHeader::new_empty(26, 1, 4 * 1024 * 1024, 128 * 1024, 16);
        h.checkpoint_count = 7;
        h.checkpoint_lsn = 1000;
        h.root_blocknum = BlockNum::new(3);
        h
    }

    #[test]
    fn slot_roundtrips() {
        let h = sample();
        let slot = h.write_slot().unwrap();
        assert_eq!(slot.len(), HEADER_RESERVE as usize);
        let back = FileHeader::read_slot(&slot).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn corrupted_checksum_is_no_header() {
        let h = sample();
        let mut slot = h.write_slot().unwrap();
        slot[8] ^= 0xff;
        assert!(matches!(FileHeader::read_slot(&slot), Err(StoreError::NoHeader)));
    }

    #[test]
    fn zeroed_slot_is_no_header_not_corruption() {
        let slot = vec![0u8; HEADER_RESERVE as usize];
        assert!(matches!(FileHeader::read_slot(&slot), Err(StoreError::NoHeader)));
    }

    #[test]
    fn choose_current_picks_higher_checkpoint_count() {
        let mut a = sample();
        a.checkpoint_count = 4;
        let mut b = sample();
        b.checkpoint_count = 5;
        let winner = choose_current(Some(a), Some(b), u64::MAX, 26).unwrap();
        assert_eq!(winner.checkpoint_count, 5);
    }

    #[test]
    fn choose_current_rejects_too_new_layout() {
        let mut h = sample();
        h.layout_version = 99;
        assert!(matches!(
            choose_current(Some(h), None, u64::MAX, 26),
            Err(StoreError::TooNew)
        ));
    }

    #[test]
    fn choose_current_rejects_too_old_layout() {
        let mut h = sample();
        h.layout_version = MIN_SUPPORTED_LAYOUT_VERSION - 1;
        assert!(matches!(
            choose_current(Some(h), None, u64::MAX, 26),
            Err(StoreError::TooOld)
        ));
    }

    #[test]
    fn choose_current_rejects_lsn_above_cap() {
        let h = sample();
        assert!(matches!(
            choose_current(Some(h), None, h.checkpoint_lsn - 1, 26),
            Err(StoreError::TooNew)
        ));
    }

    #[test]
    fn choose_current_falls_back_to_older_slot_within_cap() {
        let mut older = sample();
        older.checkpoint_count = 4;
        older.checkpoint_lsn = 100;
        let mut newer = sample();
        newer.checkpoint_count = 5;
        newer.checkpoint_lsn = 9000;
        let winner = choose_current(Some(older), Some(newer), 500, 26).unwrap();
        assert_eq!(winner.checkpoint_count, 4);
    }

    #[test]
    fn slot_too_small_for_body_is_corruption() {
        let mut h = sample();
        h.key_count_estimate = u64::MAX;
        // Construct a header whose body cannot possibly fit by shrinking
        // the reserve conceptually is not possible here; instead assert the
        // normal path fits comfortably within the real reserve.
        let slot = h.write_slot().unwrap();
        assert_eq!(slot.len(), HEADER_RESERVE as usize);
    }
}
