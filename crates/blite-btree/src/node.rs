//! On-page node format.
//!
//! Every node lives in one Index page. After the 32-byte page header comes
//! a 20-byte node header, then the packed entries:
//!
//! ```text
//! offset  field
//! 32..36  page_id           u32 (repeats the page header's id)
//! 36      is_leaf           u8
//! 37..39  entry_count       u16
//! 39..43  parent_page_id    u32
//! 43..47  next_leaf_page_id u32 (internal nodes: leftmost child id)
//! 47..51  prev_leaf_page_id u32
//! 51      reserved
//! 52..    (key_len u16, key bytes, payload)*
//! ```
//!
//! Leaf payloads are 6-byte document locations; internal payloads are
//! 4-byte child page ids.

use blite_error::{BliteError, Result};
use blite_pager::PageHeader;
use blite_types::{DocumentLocation, NO_PAGE, PageId, PageType};

/// Node header width.
pub const NODE_HEADER_LEN: usize = 20;
/// First entry byte within the page.
pub const ENTRIES_OFFSET: usize = 32 + NODE_HEADER_LEN;
/// Hard ceiling on a single index key, so any two entries plus the headers
/// always fit the smallest supported page.
pub const MAX_KEY_LEN: usize = 1024;

/// Entry payload: where the key points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePayload {
    /// Leaf entry: the document's physical location.
    Location(DocumentLocation),
    /// Internal entry: child page holding keys `>=` this separator.
    Child(PageId),
}

impl NodePayload {
    fn encoded_len(self) -> usize {
        match self {
            Self::Location(_) => DocumentLocation::ENCODED_LEN,
            Self::Child(_) => 4,
        }
    }

    /// The child page id, for internal entries.
    pub fn child(self) -> Result<PageId> {
        match self {
            Self::Child(page_id) => Ok(page_id),
            Self::Location(_) => Err(BliteError::internal("leaf payload where child expected")),
        }
    }

    /// The document location, for leaf entries.
    pub fn location(self) -> Result<DocumentLocation> {
        match self {
            Self::Location(loc) => Ok(loc),
            Self::Child(_) => Err(BliteError::internal("child payload where location expected")),
        }
    }
}

/// Decoded node, mutated in memory and re-encoded into a page buffer for
/// `Txn::add_write`.
#[derive(Debug, Clone)]
pub struct Node {
    pub page_id: PageId,
    pub is_leaf: bool,
    pub parent: PageId,
    /// Leaf: next sibling in key order. Internal: leftmost child.
    pub next_leaf: PageId,
    /// Leaf: previous sibling. Internal: unused.
    pub prev_leaf: PageId,
    pub entries: Vec<(Vec<u8>, NodePayload)>,
}

impl Node {
    /// Fresh empty leaf.
    #[must_use]
    pub fn new_leaf(page_id: PageId) -> Self {
        Self {
            page_id,
            is_leaf: true,
            parent: NO_PAGE,
            next_leaf: NO_PAGE,
            prev_leaf: NO_PAGE,
            entries: Vec::new(),
        }
    }

    /// Fresh internal node with its leftmost child set.
    #[must_use]
    pub fn new_internal(page_id: PageId, leftmost_child: PageId) -> Self {
        Self {
            page_id,
            is_leaf: false,
            parent: NO_PAGE,
            next_leaf: leftmost_child,
            prev_leaf: NO_PAGE,
            entries: Vec::new(),
        }
    }

    /// Internal nodes store the leftmost child in the `next_leaf` slot.
    #[must_use]
    pub fn leftmost_child(&self) -> PageId {
        self.next_leaf
    }

    pub fn set_leftmost_child(&mut self, child: PageId) {
        self.next_leaf = child;
    }

    /// Bytes this node occupies when encoded.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ENTRIES_OFFSET
            + self
                .entries
                .iter()
                .map(|(key, payload)| 2 + key.len() + payload.encoded_len())
                .sum::<usize>()
    }

    /// Whether the node still fits a page of `page_size` bytes.
    #[must_use]
    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_size() <= page_size
    }

    /// Serialize into a full page image.
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(BliteError::internal(format!(
                "node {} of {} bytes exceeds the page size",
                self.page_id,
                self.encoded_size()
            )));
        }
        let mut buf = vec![0_u8; page_size];
        PageHeader::new(self.page_id, PageType::Index).write(&mut buf);

        buf[32..36].copy_from_slice(&self.page_id.to_le_bytes());
        buf[36] = u8::from(self.is_leaf);
        buf[37..39].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        buf[39..43].copy_from_slice(&self.parent.to_le_bytes());
        buf[43..47].copy_from_slice(&self.next_leaf.to_le_bytes());
        buf[47..51].copy_from_slice(&self.prev_leaf.to_le_bytes());
        buf[51] = 0;

        let mut at = ENTRIES_OFFSET;
        for (key, payload) in &self.entries {
            buf[at..at + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            at += 2;
            buf[at..at + key.len()].copy_from_slice(key);
            at += key.len();
            match payload {
                NodePayload::Location(loc) => {
                    buf[at..at + DocumentLocation::ENCODED_LEN].copy_from_slice(&loc.to_bytes());
                    at += DocumentLocation::ENCODED_LEN;
                }
                NodePayload::Child(child) => {
                    buf[at..at + 4].copy_from_slice(&child.to_le_bytes());
                    at += 4;
                }
            }
        }
        Ok(buf)
    }

    /// Parse a node out of an Index page image.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = PageHeader::read(buf)?;
        if header.page_type != PageType::Index {
            return Err(BliteError::invalid_format(format!(
                "page {} is {:?}, not Index",
                header.page_id, header.page_type
            )));
        }
        if buf.len() < ENTRIES_OFFSET {
            return Err(BliteError::invalid_format("index page shorter than node header"));
        }

        let page_id = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);
        if page_id != header.page_id {
            return Err(BliteError::invalid_format(format!(
                "node header id {page_id} disagrees with page id {}",
                header.page_id
            )));
        }
        let is_leaf = match buf[36] {
            0 => false,
            1 => true,
            other => {
                return Err(BliteError::invalid_format(format!(
                    "node leaf flag must be 0 or 1, got {other}"
                )));
            }
        };
        let entry_count = usize::from(u16::from_le_bytes([buf[37], buf[38]]));
        let parent = u32::from_le_bytes([buf[39], buf[40], buf[41], buf[42]]);
        let next_leaf = u32::from_le_bytes([buf[43], buf[44], buf[45], buf[46]]);
        let prev_leaf = u32::from_le_bytes([buf[47], buf[48], buf[49], buf[50]]);

        let mut entries = Vec::with_capacity(entry_count);
        let mut at = ENTRIES_OFFSET;
        for _ in 0..entry_count {
            if at + 2 > buf.len() {
                return Err(BliteError::invalid_format("node entry overruns its page"));
            }
            let key_len = usize::from(u16::from_le_bytes([buf[at], buf[at + 1]]));
            at += 2;
            let payload_len = if is_leaf { DocumentLocation::ENCODED_LEN } else { 4 };
            if at + key_len + payload_len > buf.len() {
                return Err(BliteError::invalid_format("node entry overruns its page"));
            }
            let key = buf[at..at + key_len].to_vec();
            at += key_len;
            let payload = if is_leaf {
                NodePayload::Location(DocumentLocation::from_bytes(&buf[at..at + payload_len])?)
            } else {
                NodePayload::Child(u32::from_le_bytes([
                    buf[at],
                    buf[at + 1],
                    buf[at + 2],
                    buf[at + 3],
                ]))
            };
            at += payload_len;
            entries.push((key, payload));
        }

        Ok(Self {
            page_id,
            is_leaf,
            parent,
            next_leaf,
            prev_leaf,
            entries,
        })
    }

    /// Position of the first entry with `key >= probe` (insertion point).
    #[must_use]
    pub fn lower_bound(&self, probe: &[u8]) -> usize {
        self.entries.partition_point(|(key, _)| key.as_slice() < probe)
    }

    /// Child to descend into for `probe` (internal nodes): the rightmost
    /// entry whose separator is `<= probe`, else the leftmost child.
    pub fn child_for(&self, probe: &[u8]) -> Result<PageId> {
        if self.is_leaf {
            return Err(BliteError::internal("descending through a leaf"));
        }
        let pos = self.entries.partition_point(|(key, _)| key.as_slice() <= probe);
        if pos == 0 {
            Ok(self.leftmost_child())
        } else {
            self.entries[pos - 1].1.child()
        }
    }

    /// Exact-match position, if the key is present.
    #[must_use]
    pub fn find_exact(&self, probe: &[u8]) -> Option<usize> {
        let pos = self.lower_bound(probe);
        (pos < self.entries.len() && self.entries[pos].0 == probe).then_some(pos)
    }
}
