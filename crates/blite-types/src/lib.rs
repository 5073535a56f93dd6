//! Core type definitions shared by every BLite crate.
//!
//! Everything here is plain data: page identifiers, record locations,
//! key encodings, configuration, and the cancellation token. No I/O.

pub mod cx;
mod oid;
mod options;

pub use cx::Cx;
pub use oid::ObjectId;
pub use options::Options;

use blite_error::{BliteError, Result};

/// 32-bit page identifier. Page offsets are `page_id * page_size`.
pub type PageId = u32;

/// Sentinel page id meaning "no page" in chain links. Page 0 holds the
/// file header and never participates in a chain, so 0 is unambiguous.
pub const NO_PAGE: PageId = 0;

/// Page reserved for the file header.
pub const HEADER_PAGE_ID: PageId = 0;

/// Page reserved for the collection catalog.
pub const CATALOG_PAGE_ID: PageId = 1;

/// 64-bit transaction identifier, assigned monotonically from 1.
pub type TxnId = u64;

/// 16-bit field identifier assigned by the field-name schema. 0 is reserved.
pub type FieldId = u16;

/// Byte size of the common page header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 32;

// ---------------------------------------------------------------------------
// Page types
// ---------------------------------------------------------------------------

/// Discriminant stored in byte 4 of every page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Empty = 0,
    FileHeader = 1,
    CollectionCatalog = 2,
    Data = 3,
    Index = 4,
    Overflow = 6,
    Dictionary = 7,
    Schema = 8,
    Vector = 9,
    Free = 10,
    Spatial = 11,
    TimeSeries = 12,
}

impl PageType {
    /// Decode a page-type byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Empty),
            1 => Ok(Self::FileHeader),
            2 => Ok(Self::CollectionCatalog),
            3 => Ok(Self::Data),
            4 => Ok(Self::Index),
            6 => Ok(Self::Overflow),
            7 => Ok(Self::Dictionary),
            8 => Ok(Self::Schema),
            9 => Ok(Self::Vector),
            10 => Ok(Self::Free),
            11 => Ok(Self::Spatial),
            12 => Ok(Self::TimeSeries),
            other => Err(BliteError::invalid_format(format!(
                "unknown page type byte {other}"
            ))),
        }
    }

    /// Encode as the header byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Slot flags
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Per-slot flags inside a Data page's slot directory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Slot has been deleted; space reclaimable on next compaction.
        const DELETED = 0b0001;
        /// Record continues in an Overflow page chain.
        const HAS_OVERFLOW = 0b0010;
    }
}

// ---------------------------------------------------------------------------
// Document location
// ---------------------------------------------------------------------------

/// Physical address of a document: `(PageId, SlotIndex)`. 6 bytes serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentLocation {
    pub page_id: PageId,
    pub slot: u16,
}

impl DocumentLocation {
    /// Serialized width in bytes.
    pub const ENCODED_LEN: usize = 6;

    #[must_use]
    pub const fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }

    /// Little-endian 6-byte encoding, page id first.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0_u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.page_id.to_le_bytes());
        out[4..].copy_from_slice(&self.slot.to_le_bytes());
        out
    }

    /// Decode the 6-byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(BliteError::malformed("truncated document location"));
        }
        let page_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let slot = u16::from_le_bytes([bytes[4], bytes[5]]);
        Ok(Self { page_id, slot })
    }
}

// ---------------------------------------------------------------------------
// Index keys
// ---------------------------------------------------------------------------

/// Opaque index key ordered by unsigned lexicographic byte comparison.
///
/// The encoders below preserve the domain order of the common key types;
/// anything else is the collection owner's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    /// Wrap pre-encoded key bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// ObjectIds are already byte-ordered; the 12 raw bytes are the key.
    #[must_use]
    pub fn from_object_id(oid: ObjectId) -> Self {
        Self(oid.as_bytes().to_vec())
    }

    /// Signed 64-bit integers: flip the sign bit, store big-endian.
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        let flipped = (value as u64) ^ (1 << 63);
        Self(flipped.to_be_bytes().to_vec())
    }

    /// Signed 32-bit integers widen to the 64-bit encoding so mixed
    /// Int32/Int64 id fields stay mutually ordered.
    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        Self::from_i64(i64::from(value))
    }

    /// Strings: UTF-8 bytes plus a 0x00 terminator so no key is a strict
    /// prefix of another.
    #[must_use]
    pub fn from_str_key(value: &str) -> Self {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        Self(bytes)
    }

    /// Composite key for non-unique indexes: `user_key || location` so
    /// duplicates sort deterministically and remove() can target one entry.
    #[must_use]
    pub fn composite(&self, loc: DocumentLocation) -> Self {
        let mut bytes = Vec::with_capacity(self.0.len() + DocumentLocation::ENCODED_LEN);
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(&loc.to_bytes());
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` starts with `prefix`'s bytes.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl AsRef<[u8]> for IndexKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for IndexKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_page_type_round_trip() {
        for byte in [0_u8, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11, 12] {
            let ty = PageType::from_byte(byte).unwrap();
            assert_eq!(ty.as_byte(), byte);
        }
        assert!(PageType::from_byte(5).is_err());
        assert!(PageType::from_byte(200).is_err());
    }

    #[test]
    fn test_document_location_round_trip() {
        let loc = DocumentLocation::new(0xDEAD_BEEF, 0x1234);
        let decoded = DocumentLocation::from_bytes(&loc.to_bytes()).unwrap();
        assert_eq!(decoded, loc);
    }

    #[test]
    fn test_document_location_truncated() {
        assert!(DocumentLocation::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_i64_key_order_matches_integer_order() {
        let values = [i64::MIN, -1_000, -1, 0, 1, 42, i64::MAX];
        for window in values.windows(2) {
            let a = IndexKey::from_i64(window[0]);
            let b = IndexKey::from_i64(window[1]);
            assert!(a < b, "{} should order below {}", window[0], window[1]);
        }
    }

    #[test]
    fn test_string_key_prefix_termination() {
        // "ab" must order before "b" and no key is a prefix of another.
        let ab = IndexKey::from_str_key("ab");
        let b = IndexKey::from_str_key("b");
        assert!(ab < b);
        assert!(!ab.as_bytes().starts_with(b.as_bytes()));
    }

    #[test]
    fn test_composite_key_groups_by_user_key() {
        let user = IndexKey::from_i64(7);
        let first = user.composite(DocumentLocation::new(3, 0));
        let second = user.composite(DocumentLocation::new(3, 1));
        assert!(first < second);
        assert!(first.starts_with(&user));
        assert!(second.starts_with(&user));
    }

    proptest! {
        #[test]
        fn prop_i64_key_order(a in any::<i64>(), b in any::<i64>()) {
            let ka = IndexKey::from_i64(a);
            let kb = IndexKey::from_i64(b);
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }
    }
}
