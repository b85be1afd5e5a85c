#![forbid(unsafe_code)]

use super::PageKey;

/// Computes the crc32 of a page slot area, salted with its location so a
/// block written to the wrong offset fails verification.
pub fn page_crc32(key: &PageKey, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key.column.to_le_bytes());
    hasher.update(&key.range.0.to_le_bytes());
    hasher.update(&key.page.0.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
