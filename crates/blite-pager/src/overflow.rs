//! Overflow chains for documents larger than a page's usable area.
//!
//! The primary Data slot keeps a stub: total length, the id of the first
//! Overflow page, and as much of the document as fits inline. Each
//! Overflow page stores `chunk_len(u16)` at offset 32 followed by the
//! chunk; pages link through the header's `next_page_id`.

use blite_error::{BliteError, Result};
use blite_types::{NO_PAGE, PAGE_HEADER_SIZE, PageId, PageType};

use crate::header::PageHeader;

/// Stub prefix ahead of the inline chunk: total_len(4) || head_page(4).
pub const STUB_PREFIX_LEN: usize = 8;

/// Chunk bytes an Overflow page can carry.
#[must_use]
pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - 2
}

/// Parsed overflow stub stored in the primary slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowStub<'a> {
    /// Full document length across all chunks.
    pub total_len: u32,
    /// First Overflow page of the chain.
    pub head_page: PageId,
    /// The leading chunk kept inline in the Data slot.
    pub inline: &'a [u8],
}

/// Build the stub record for the primary slot.
#[must_use]
pub fn encode_stub(total_len: u32, head_page: PageId, inline: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STUB_PREFIX_LEN + inline.len());
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&head_page.to_le_bytes());
    out.extend_from_slice(inline);
    out
}

/// Parse the stub record read from the primary slot.
pub fn decode_stub(bytes: &[u8]) -> Result<OverflowStub<'_>> {
    if bytes.len() < STUB_PREFIX_LEN {
        return Err(BliteError::malformed("overflow stub shorter than its prefix"));
    }
    let total_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let head_page = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if head_page == NO_PAGE {
        return Err(BliteError::malformed("overflow stub without a chain head"));
    }
    Ok(OverflowStub {
        total_len,
        head_page,
        inline: &bytes[STUB_PREFIX_LEN..],
    })
}

/// Fill an Overflow page image with one chunk and its chain link.
pub fn write_chunk(
    buf: &mut [u8],
    page_id: PageId,
    next_page: PageId,
    chunk: &[u8],
) -> Result<()> {
    if chunk.len() > chunk_capacity(buf.len()) {
        return Err(BliteError::internal(format!(
            "overflow chunk of {} bytes exceeds page capacity",
            chunk.len()
        )));
    }
    let mut header = PageHeader::new(page_id, PageType::Overflow);
    header.next_page_id = next_page;
    header.write(buf);
    let at = PAGE_HEADER_SIZE;
    buf[at..at + 2].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
    buf[at + 2..at + 2 + chunk.len()].copy_from_slice(chunk);
    Ok(())
}

/// Read the chunk and next-page link out of an Overflow page image.
pub fn read_chunk(buf: &[u8]) -> Result<(&[u8], PageId)> {
    let header = PageHeader::read(buf)?;
    if header.page_type != PageType::Overflow {
        return Err(BliteError::invalid_format(format!(
            "page {} is {:?}, not Overflow",
            header.page_id, header.page_type
        )));
    }
    let at = PAGE_HEADER_SIZE;
    let len = usize::from(u16::from_le_bytes([buf[at], buf[at + 1]]));
    if at + 2 + len > buf.len() {
        return Err(BliteError::malformed("overflow chunk overruns its page"));
    }
    Ok((&buf[at + 2..at + 2 + len], header.next_page_id))
}
