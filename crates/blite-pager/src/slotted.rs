//! Slotted layout for Data pages.
//!
//! The slot directory grows upward from the end of the 32-byte page
//! header; document bytes are packed downward from the page end. The
//! header's `free_bytes` always equals `free_space_end - free_space_start`,
//! where `free_space_start` is derived as `32 + 8 * slot_count`.

use blite_error::{BliteError, Result};
use blite_types::{PAGE_HEADER_SIZE, PageId, PageType, SlotFlags, TxnId};

use crate::header::PageHeader;

/// Bytes per slot directory entry: offset(2), length(2), flags(4).
pub const SLOT_SIZE: usize = 8;

/// One slot directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16,
    pub length: u16,
    pub flags: SlotFlags,
}

impl Slot {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(SlotFlags::DELETED)
    }

    #[must_use]
    pub fn has_overflow(&self) -> bool {
        self.flags.contains(SlotFlags::HAS_OVERFLOW)
    }
}

/// Result of [`SlottedPage::update`].
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The new bytes replaced the old record in its slot.
    InPlace,
    /// The record no longer fits here; the old slot was marked deleted and
    /// the caller must insert the bytes elsewhere.
    NeedsRelocation,
}

/// A Data page buffer with slotted-record accessors.
///
/// The page owns its byte buffer; callers hand the buffer back to the
/// transaction layer via [`SlottedPage::into_bytes`] once mutated.
#[derive(Debug, Clone)]
pub struct SlottedPage {
    buf: Vec<u8>,
}

impl SlottedPage {
    /// Fresh empty Data page.
    #[must_use]
    pub fn new(page_id: PageId, page_size: usize) -> Self {
        let mut buf = vec![0_u8; page_size];
        let mut header = PageHeader::new(page_id, PageType::Data);
        header.free_space_end = page_size as u16;
        header.free_bytes = (page_size - PAGE_HEADER_SIZE) as u16;
        header.write(&mut buf);
        Self { buf }
    }

    /// Wrap an existing Data page image.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let header = PageHeader::read(&buf)?;
        if header.page_type != PageType::Data {
            return Err(BliteError::invalid_format(format!(
                "page {} is {:?}, not Data",
                header.page_id, header.page_type
            )));
        }
        Ok(Self { buf })
    }

    /// Parsed header of this page.
    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::read(&self.buf)
    }

    #[must_use]
    pub fn page_id(&self) -> PageId {
        u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
    }

    #[must_use]
    pub fn slot_count(&self) -> u16 {
        u16::from_le_bytes([self.buf[27], self.buf[28]])
    }

    #[must_use]
    pub fn free_bytes(&self) -> u16 {
        u16::from_le_bytes([self.buf[5], self.buf[6]])
    }

    fn free_space_end(&self) -> u16 {
        u16::from_le_bytes([self.buf[29], self.buf[30]])
    }

    fn free_space_start(&self) -> usize {
        PAGE_HEADER_SIZE + SLOT_SIZE * usize::from(self.slot_count())
    }

    /// Next data-page id in the collection chain.
    #[must_use]
    pub fn next_page_id(&self) -> PageId {
        u32::from_le_bytes([self.buf[7], self.buf[8], self.buf[9], self.buf[10]])
    }

    /// Link this page to the next one in the collection chain.
    pub fn set_next_page_id(&mut self, next: PageId) {
        self.buf[7..11].copy_from_slice(&next.to_le_bytes());
    }

    /// Stamp the id of the last transaction that modified this page.
    pub fn set_txn_id(&mut self, txn_id: TxnId) {
        self.buf[11..19].copy_from_slice(&txn_id.to_le_bytes());
    }

    /// Whether `len` more bytes (plus a slot entry) fit.
    #[must_use]
    pub fn can_fit(&self, len: usize) -> bool {
        len + SLOT_SIZE <= usize::from(self.free_bytes())
    }

    /// Largest record a page of `page_size` can hold inline.
    #[must_use]
    pub fn usable_capacity(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE - SLOT_SIZE
    }

    // -----------------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------------

    /// Append a record, returning its slot index.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<u16> {
        self.insert_with_flags(bytes, SlotFlags::empty())
    }

    /// Append a record with explicit flags (overflow stubs set
    /// `HAS_OVERFLOW`).
    pub fn insert_with_flags(&mut self, bytes: &[u8], flags: SlotFlags) -> Result<u16> {
        if !self.can_fit(bytes.len()) {
            return Err(BliteError::internal(format!(
                "record of {} bytes does not fit ({} free)",
                bytes.len(),
                self.free_bytes()
            )));
        }
        let slot_index = self.slot_count();
        let offset = usize::from(self.free_space_end()) - bytes.len();
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.write_slot(
            slot_index,
            Slot {
                offset: offset as u16,
                length: bytes.len() as u16,
                flags,
            },
        );
        self.set_slot_count(slot_index + 1);
        self.set_free_space_end(offset as u16);
        self.recompute_free_bytes();
        Ok(slot_index)
    }

    /// Record bytes at `slot_index`. Fails on deleted slots.
    pub fn read(&self, slot_index: u16) -> Result<&[u8]> {
        let slot = self.slot(slot_index)?;
        if slot.is_deleted() {
            return Err(BliteError::not_found(format!(
                "slot {slot_index} of page {} is deleted",
                self.page_id()
            )));
        }
        let start = usize::from(slot.offset);
        Ok(&self.buf[start..start + usize::from(slot.length)])
    }

    /// Replace the record in place when the new bytes fit the old extent,
    /// otherwise mark the slot deleted and ask the caller to relocate.
    pub fn update(&mut self, slot_index: u16, bytes: &[u8]) -> Result<UpdateOutcome> {
        let slot = self.slot(slot_index)?;
        if slot.is_deleted() {
            return Err(BliteError::not_found(format!(
                "slot {slot_index} of page {} is deleted",
                self.page_id()
            )));
        }
        if bytes.len() <= usize::from(slot.length) {
            let start = usize::from(slot.offset);
            self.buf[start..start + bytes.len()].copy_from_slice(bytes);
            self.write_slot(
                slot_index,
                Slot {
                    offset: slot.offset,
                    length: bytes.len() as u16,
                    flags: slot.flags,
                },
            );
            return Ok(UpdateOutcome::InPlace);
        }
        self.delete(slot_index)?;
        Ok(UpdateOutcome::NeedsRelocation)
    }

    /// Mark a slot deleted. Space is reclaimed by [`SlottedPage::compact`].
    pub fn delete(&mut self, slot_index: u16) -> Result<()> {
        let mut slot = self.slot(slot_index)?;
        slot.flags |= SlotFlags::DELETED;
        self.write_slot(slot_index, slot);
        Ok(())
    }

    /// Rewrite live records contiguously and rebuild the slot directory.
    ///
    /// Slot indexes change, so this is only run by maintenance paths that
    /// also rewrite the affected index entries.
    pub fn compact(&mut self) -> Result<Vec<(u16, u16)>> {
        let page_size = self.buf.len();
        let mut live: Vec<(u16, Vec<u8>, SlotFlags)> = Vec::new();
        for index in 0..self.slot_count() {
            let slot = self.slot(index)?;
            if !slot.is_deleted() {
                live.push((index, self.read(index)?.to_vec(), slot.flags));
            }
        }

        // Reset the record area and directory, then re-insert.
        self.set_slot_count(0);
        self.set_free_space_end(page_size as u16);
        self.recompute_free_bytes();

        let mut moves = Vec::with_capacity(live.len());
        for (old_index, bytes, flags) in live {
            let new_index = self.insert_with_flags(&bytes, flags)?;
            moves.push((old_index, new_index));
        }
        Ok(moves)
    }

    /// Slot directory entry at `slot_index`.
    pub fn slot(&self, slot_index: u16) -> Result<Slot> {
        if slot_index >= self.slot_count() {
            return Err(BliteError::not_found(format!(
                "slot {slot_index} of page {} (count {})",
                self.page_id(),
                self.slot_count()
            )));
        }
        let at = PAGE_HEADER_SIZE + SLOT_SIZE * usize::from(slot_index);
        let flags_raw = u32::from_le_bytes([
            self.buf[at + 4],
            self.buf[at + 5],
            self.buf[at + 6],
            self.buf[at + 7],
        ]);
        Ok(Slot {
            offset: u16::from_le_bytes([self.buf[at], self.buf[at + 1]]),
            length: u16::from_le_bytes([self.buf[at + 2], self.buf[at + 3]]),
            flags: SlotFlags::from_bits_truncate(flags_raw),
        })
    }

    /// Indexes of every live slot.
    pub fn live_slots(&self) -> Result<Vec<u16>> {
        let mut out = Vec::new();
        for index in 0..self.slot_count() {
            if !self.slot(index)?.is_deleted() {
                out.push(index);
            }
        }
        Ok(out)
    }

    /// Give the buffer back (for `Txn::add_write`).
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Borrow the underlying page image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // -----------------------------------------------------------------------
    // Internal field writers
    // -----------------------------------------------------------------------

    fn write_slot(&mut self, slot_index: u16, slot: Slot) {
        let at = PAGE_HEADER_SIZE + SLOT_SIZE * usize::from(slot_index);
        self.buf[at..at + 2].copy_from_slice(&slot.offset.to_le_bytes());
        self.buf[at + 2..at + 4].copy_from_slice(&slot.length.to_le_bytes());
        self.buf[at + 4..at + 8].copy_from_slice(&slot.flags.bits().to_le_bytes());
    }

    fn set_slot_count(&mut self, count: u16) {
        self.buf[27..29].copy_from_slice(&count.to_le_bytes());
    }

    fn set_free_space_end(&mut self, end: u16) {
        self.buf[29..31].copy_from_slice(&end.to_le_bytes());
    }

    fn recompute_free_bytes(&mut self) {
        let free = usize::from(self.free_space_end()) - self.free_space_start();
        self.buf[5..7].copy_from_slice(&(free as u16).to_le_bytes());
    }
}
