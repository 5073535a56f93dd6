//! The 32-byte header at the start of every page.
//!
//! ```text
//! offset  field
//! 0..4    page_id          u32
//! 4       page_type        u8
//! 5..7    free_bytes       u16   (Data pages)
//! 7..11   next_page_id     u32   (free-list / data chain / overflow chain)
//! 11..19  txn_id           u64   (last transaction that modified the page)
//! 19..23  checksum         u32   (crc32c of the page excluding this field)
//! 23..27  dictionary_root  u32   (meaningful on page 0 only)
//! 27..29  slot_count       u16   (Data pages)
//! 29..31  free_space_end   u16   (Data pages)
//! 31      reserved
//! ```
//!
//! All integers little-endian.

use blite_error::{BliteError, Result};
use blite_types::{PAGE_HEADER_SIZE, PageId, PageType, TxnId};

/// Parsed form of the common page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_id: PageId,
    pub page_type: PageType,
    pub free_bytes: u16,
    pub next_page_id: PageId,
    pub txn_id: TxnId,
    pub checksum: u32,
    pub dictionary_root: PageId,
    pub slot_count: u16,
    pub free_space_end: u16,
}

impl PageHeader {
    /// Fresh header for a newly stamped page of `page_type`.
    #[must_use]
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            free_bytes: 0,
            next_page_id: 0,
            txn_id: 0,
            checksum: 0,
            dictionary_root: 0,
            slot_count: 0,
            free_space_end: 0,
        }
    }

    /// Parse the first 32 bytes of a page buffer.
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(BliteError::invalid_format("page shorter than its header"));
        }
        Ok(Self {
            page_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            page_type: PageType::from_byte(buf[4])?,
            free_bytes: u16::from_le_bytes([buf[5], buf[6]]),
            next_page_id: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
            txn_id: u64::from_le_bytes([
                buf[11], buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18],
            ]),
            checksum: u32::from_le_bytes([buf[19], buf[20], buf[21], buf[22]]),
            dictionary_root: u32::from_le_bytes([buf[23], buf[24], buf[25], buf[26]]),
            slot_count: u16::from_le_bytes([buf[27], buf[28]]),
            free_space_end: u16::from_le_bytes([buf[29], buf[30]]),
        })
    }

    /// Serialize into the first 32 bytes of a page buffer.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4] = self.page_type.as_byte();
        buf[5..7].copy_from_slice(&self.free_bytes.to_le_bytes());
        buf[7..11].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[11..19].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[19..23].copy_from_slice(&self.checksum.to_le_bytes());
        buf[23..27].copy_from_slice(&self.dictionary_root.to_le_bytes());
        buf[27..29].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[29..31].copy_from_slice(&self.free_space_end.to_le_bytes());
        buf[31] = 0;
    }
}

/// Checksum of a page buffer: crc32c over everything except the stored
/// checksum field at bytes 19..23.
#[must_use]
pub fn compute_checksum(buf: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&buf[..19]);
    crc32c::crc32c_append(crc, &buf[23..])
}

/// Stamp the checksum field with the current page contents.
pub fn stamp_checksum(buf: &mut [u8]) {
    let crc = compute_checksum(buf);
    buf[19..23].copy_from_slice(&crc.to_le_bytes());
}

/// Validate a page read from disk against its stored checksum.
pub fn verify_checksum(page_id: PageId, buf: &[u8]) -> Result<()> {
    let stored = u32::from_le_bytes([buf[19], buf[20], buf[21], buf[22]]);
    let computed = compute_checksum(buf);
    if stored != computed {
        return Err(BliteError::ChecksumMismatch {
            page_id,
            stored,
            computed,
        });
    }
    Ok(())
}
