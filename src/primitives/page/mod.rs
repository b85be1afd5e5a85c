#![forbid(unsafe_code)]

//! Fixed-capacity page of fixed-width column slots.
//!
//! Layout of every page block:
//!
//! ```text
//! 0..4    magic "LSTP"
//! 4..6    format version (le u16)
//! 6       page kind (1 = base, 2 = tail)
//! 7       reserved
//! 8..12   num_records (le u32)
//! 12..16  crc32 of the slot area (le u32)
//! 16..    8-byte little-endian slots
//! ```
//!
//! A block that was never written reads back as all zeroes; such a page is
//! "blank" and is accepted without checksum verification.

use core::convert::TryFrom;

use crate::types::checksum::page_crc32;
use crate::types::{LStoreError, PageKey, Result};

/// Magic prefix of every written page.
pub const PAGE_MAGIC: [u8; 4] = *b"LSTP";
/// On-disk format version.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Header length in bytes.
pub const PAGE_HDR_LEN: usize = 16;
/// Width of one column slot in bytes.
pub const SLOT_WIDTH: usize = 8;
/// Page size used when no options override it.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

mod header {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const PAGE_KIND: usize = 6;
    pub const NUM_RECORDS: Range<usize> = 8..12;
    pub const CRC32: Range<usize> = 12..16;
}

/// Role of a page inside a page range.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Base page holding original or merged values.
    Base = 1,
    /// Append-only tail page holding update entries.
    Tail = 2,
}

impl TryFrom<u8> for PageKind {
    type Error = LStoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Base),
            2 => Ok(PageKind::Tail),
            _ => Err(LStoreError::Corruption("unknown page kind")),
        }
    }
}

/// Number of slots a page of `page_size` bytes holds.
pub const fn slots_per_page(page_size: usize) -> usize {
    if page_size <= PAGE_HDR_LEN {
        0
    } else {
        (page_size - PAGE_HDR_LEN) / SLOT_WIDTH
    }
}

/// In-memory image of one page block.
#[derive(Clone)]
pub struct Page {
    buf: Box<[u8]>,
}

impl Page {
    /// Creates an initialised, empty page of the given kind.
    pub fn new(kind: PageKind, page_size: usize) -> Self {
        let mut page = Self::blank(page_size);
        page.buf[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        page.buf[header::FORMAT_VERSION].copy_from_slice(&PAGE_FORMAT_VERSION.to_le_bytes());
        page.buf[header::PAGE_KIND] = kind as u8;
        page
    }

    /// Creates an all-zero page, the image of a block never written.
    pub fn blank(page_size: usize) -> Self {
        Self {
            buf: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Wraps bytes read from disk, validating the header when present.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let page = Self {
            buf: bytes.to_vec().into_boxed_slice(),
        };
        if !page.is_blank() {
            if page.buf.len() < PAGE_HDR_LEN || page.buf[header::MAGIC] != PAGE_MAGIC {
                return Err(LStoreError::Corruption("bad page magic"));
            }
            let version = u16::from_le_bytes([page.buf[4], page.buf[5]]);
            if version != PAGE_FORMAT_VERSION {
                return Err(LStoreError::Corruption("unsupported page format version"));
            }
            page.kind()?;
        }
        Ok(page)
    }

    /// Returns true when the header was never initialised.
    pub fn is_blank(&self) -> bool {
        self.buf[header::MAGIC].iter().all(|&b| b == 0)
    }

    /// Page kind recorded in the header.
    pub fn kind(&self) -> Result<PageKind> {
        PageKind::try_from(self.buf[header::PAGE_KIND])
    }

    /// Number of slots this page holds.
    pub fn capacity(&self) -> usize {
        slots_per_page(self.buf.len())
    }

    /// Number of slots filled so far.
    pub fn num_records(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[header::NUM_RECORDS]);
        u32::from_le_bytes(raw)
    }

    /// Records how many slots are filled.
    pub fn set_num_records(&mut self, n: u32) {
        self.buf[header::NUM_RECORDS].copy_from_slice(&n.to_le_bytes());
    }

    /// True when every slot is filled.
    pub fn is_full(&self) -> bool {
        self.num_records() as usize >= self.capacity()
    }

    fn slot_range(&self, slot: usize) -> Result<core::ops::Range<usize>> {
        if slot >= self.capacity() {
            return Err(LStoreError::Invalid("slot out of range"));
        }
        let start = PAGE_HDR_LEN + slot * SLOT_WIDTH;
        Ok(start..start + SLOT_WIDTH)
    }

    /// Reads one slot as a signed column value.
    pub fn read_slot(&self, slot: usize) -> Result<i64> {
        let range = self.slot_range(slot)?;
        let mut raw = [0u8; SLOT_WIDTH];
        raw.copy_from_slice(&self.buf[range]);
        Ok(i64::from_le_bytes(raw))
    }

    /// Writes one slot.
    pub fn write_slot(&mut self, slot: usize, value: i64) -> Result<()> {
        let range = self.slot_range(slot)?;
        self.buf[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Reads a metadata slot as an unsigned word.
    pub fn read_word(&self, slot: usize) -> Result<u64> {
        self.read_slot(slot).map(|v| v as u64)
    }

    /// Writes a metadata slot from an unsigned word.
    pub fn write_word(&mut self, slot: usize, value: u64) -> Result<()> {
        self.write_slot(slot, value as i64)
    }

    /// Stamps the crc32 of the slot area before the page is written out.
    pub fn seal_checksum(&mut self, key: &PageKey) {
        if self.is_blank() {
            return;
        }
        let crc = page_crc32(key, &self.buf[PAGE_HDR_LEN..]);
        self.buf[header::CRC32].copy_from_slice(&crc.to_le_bytes());
    }

    /// Verifies the stamped crc32 against the slot area.
    pub fn verify_checksum(&self, key: &PageKey) -> Result<()> {
        if self.is_blank() {
            return Ok(());
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[header::CRC32]);
        if u32::from_le_bytes(raw) != page_crc32(key, &self.buf[PAGE_HDR_LEN..]) {
            return Err(LStoreError::Corruption("page checksum mismatch"));
        }
        Ok(())
    }

    /// Raw page bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Page size in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True for a zero-sized page.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("kind", &self.kind().ok())
            .field("num_records", &self.num_records())
            .field("capacity", &self.capacity())
            .finish()
    }
}
