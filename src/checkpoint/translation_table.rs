//! On-disk encoding of the block translation table (spec.md §6: "a
//! length-prefixed array of blocknum/offset/size/checksum entries,
//! followed by one checksum over the whole array").
//!
//! Grounded on `original_source/storage/tokudb/ft-index/ft/block_table.cc`
//! (`dump_translation_table_pretty`/`deserialize_translation_table`) and on
//! the same `[checksum][len][body]` framing [`crate::header::FileHeader`]
//! already uses for its own slots.

use crate::block::{BlockNum, BlockTranslation};
use crate::checksum::checksum;
use crate::error::{Result, StoreError};

/// Encodes `entries` as `[checksum:4][count:4][(blocknum:8, offset:8,
/// size:8, checksum:4) ...]`.
#[must_use]
pub fn encode_translation_table(entries: &[(BlockNum, BlockTranslation)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + entries.len() * 28);
    body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (blocknum, translation) in entries {
        body.extend_from_slice(&blocknum.as_u64().to_be_bytes());
        body.extend_from_slice(&translation.offset.to_be_bytes());
        body.extend_from_slice(&translation.size.to_be_bytes());
        body.extend_from_slice(&translation.checksum.to_be_bytes());
    }
    let crc = checksum(&body);
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Inverse of [`encode_translation_table`].
///
/// # Errors
/// Returns [`StoreError::Corruption`] if the buffer is truncated or the
/// checksum doesn't match.
pub fn decode_translation_table(bytes: &[u8]) -> Result<Vec<(BlockNum, BlockTranslation)>> {
    if bytes.len() < 8 {
        return Err(StoreError::Corruption("translation table: buffer too short".into()));
    }
    let crc = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let body = &bytes[4..];
    if checksum(body) != crc {
        return Err(StoreError::Corruption("translation table: checksum mismatch".into()));
    }
    let count = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4usize;
    for _ in 0..count {
        let end = pos + 28;
        if end > body.len() {
            return Err(StoreError::Corruption("translation table: entry runs past end of buffer".into()));
        }
        let blocknum = BlockNum::new(u64::from_be_bytes(body[pos..pos + 8].try_into().unwrap()));
        let offset = u64::from_be_bytes(body[pos + 8..pos + 16].try_into().unwrap());
        let size = u64::from_be_bytes(body[pos + 16..pos + 24].try_into().unwrap());
        let tcrc = u32::from_be_bytes(body[pos + 24..pos + 28].try_into().unwrap());
        entries.push((blocknum, BlockTranslation { offset, size, checksum: tcrc }));
        pos = end;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_encode_decode() {
        let entries = vec![
            (BlockNum::new(1), BlockTranslation { offset: 4096, size: 4096, checksum: 1 }),
            (BlockNum::new(2), BlockTranslation { offset: 8192, size: 1024, checksum: 2 }),
        ];
        let bytes = encode_translation_table(&entries);
        let back = decode_translation_table(&bytes).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn empty_table_roundtrips() {
        let bytes = encode_translation_table(&[]);
        let back = decode_translation_table(&bytes).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let entries = vec![(BlockNum::new(1), BlockTranslation { offset: 4096, size: 4096, checksum: 1 })];
        let mut bytes = encode_translation_table(&entries);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(decode_translation_table(&bytes).is_err());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let entries = vec![(BlockNum::new(1), BlockTranslation { offset: 4096, size: 4096, checksum: 1 })];
        let bytes = encode_translation_table(&entries);
        assert!(decode_translation_table(&bytes[..bytes.len() - 4]).is_err());
    }
}
