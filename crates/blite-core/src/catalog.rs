//! Collection catalog (page 1) and per-collection metadata pages.
//!
//! The catalog maps collection names to their metadata page; each
//! metadata page carries the collection's key type, schema version,
//! document count, primary-index root, data-page chain ends, and the
//! declared secondary indexes.

use blite_error::{BliteError, Result};
use blite_pager::PageHeader;
use blite_types::{CATALOG_PAGE_ID, NO_PAGE, PAGE_HEADER_SIZE, PageId, PageType};
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Primary-key domain of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    #[default]
    ObjectId,
    Int32,
    Int64,
    String,
}

impl KeyType {
    fn as_byte(self) -> u8 {
        match self {
            Self::ObjectId => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::String => 4,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::ObjectId),
            2 => Ok(Self::Int32),
            3 => Ok(Self::Int64),
            4 => Ok(Self::String),
            other => Err(BliteError::invalid_format(format!(
                "unknown key type byte {other}"
            ))),
        }
    }
}

/// One declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndex {
    pub field: String,
    pub unique: bool,
    pub root: PageId,
}

/// Decoded collection metadata page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    pub name: String,
    pub key_type: KeyType,
    /// Field-schema generation recorded at the last metadata write.
    pub schema_version: u64,
    pub doc_count: u64,
    pub primary_root: PageId,
    pub data_head: PageId,
    pub data_tail: PageId,
    pub indexes: Vec<SecondaryIndex>,
}

impl CollectionMeta {
    /// Fresh metadata for a collection whose primary tree is at
    /// `primary_root`.
    #[must_use]
    pub fn new(name: impl Into<String>, key_type: KeyType, primary_root: PageId) -> Self {
        Self {
            name: name.into(),
            key_type,
            schema_version: 0,
            doc_count: 0,
            primary_root,
            data_head: NO_PAGE,
            data_tail: NO_PAGE,
            indexes: Vec::new(),
        }
    }

    /// Serialize into a full Schema page image.
    pub fn encode_page(&self, page_id: PageId, page_size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; page_size];
        PageHeader::new(page_id, PageType::Schema).write(&mut buf);

        let mut at = PAGE_HEADER_SIZE;
        let name = self.name.as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(BliteError::invalid_format("collection name longer than 255 bytes"));
        }
        buf[at] = name.len() as u8;
        at += 1;
        buf[at..at + name.len()].copy_from_slice(name);
        at += name.len();
        buf[at] = self.key_type.as_byte();
        at += 1;
        buf[at..at + 8].copy_from_slice(&self.schema_version.to_le_bytes());
        at += 8;
        buf[at..at + 8].copy_from_slice(&self.doc_count.to_le_bytes());
        at += 8;
        buf[at..at + 4].copy_from_slice(&self.primary_root.to_le_bytes());
        at += 4;
        buf[at..at + 4].copy_from_slice(&self.data_head.to_le_bytes());
        at += 4;
        buf[at..at + 4].copy_from_slice(&self.data_tail.to_le_bytes());
        at += 4;
        buf[at] = self.indexes.len() as u8;
        at += 1;
        for index in &self.indexes {
            let field = index.field.as_bytes();
            if at + 1 + field.len() + 5 > page_size {
                return Err(BliteError::invalid_format("collection metadata page overflow"));
            }
            buf[at] = field.len() as u8;
            at += 1;
            buf[at..at + field.len()].copy_from_slice(field);
            at += field.len();
            buf[at] = u8::from(index.unique);
            at += 1;
            buf[at..at + 4].copy_from_slice(&index.root.to_le_bytes());
            at += 4;
        }
        Ok(buf)
    }

    /// Parse a Schema page image.
    pub fn decode_page(buf: &[u8]) -> Result<Self> {
        let header = PageHeader::read(buf)?;
        if header.page_type != PageType::Schema {
            return Err(BliteError::invalid_format(format!(
                "page {} is {:?}, not Schema",
                header.page_id, header.page_type
            )));
        }

        let mut at = PAGE_HEADER_SIZE;
        let take = |at: &mut usize, len: usize| -> Result<&[u8]> {
            if *at + len > buf.len() {
                return Err(BliteError::invalid_format("collection metadata truncated"));
            }
            let out = &buf[*at..*at + len];
            *at += len;
            Ok(out)
        };

        let name_len = usize::from(take(&mut at, 1)?[0]);
        let name = String::from_utf8(take(&mut at, name_len)?.to_vec())
            .map_err(|_| BliteError::invalid_format("collection name is not UTF-8"))?;
        let key_type = KeyType::from_byte(take(&mut at, 1)?[0])?;
        let schema_version = u64::from_le_bytes(take(&mut at, 8)?.try_into().expect("8 bytes"));
        let doc_count = u64::from_le_bytes(take(&mut at, 8)?.try_into().expect("8 bytes"));
        let primary_root = u32::from_le_bytes(take(&mut at, 4)?.try_into().expect("4 bytes"));
        let data_head = u32::from_le_bytes(take(&mut at, 4)?.try_into().expect("4 bytes"));
        let data_tail = u32::from_le_bytes(take(&mut at, 4)?.try_into().expect("4 bytes"));
        let index_count = usize::from(take(&mut at, 1)?[0]);

        let mut indexes = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let field_len = usize::from(take(&mut at, 1)?[0]);
            let field = String::from_utf8(take(&mut at, field_len)?.to_vec())
                .map_err(|_| BliteError::invalid_format("index field is not UTF-8"))?;
            let unique = take(&mut at, 1)?[0] != 0;
            let root = u32::from_le_bytes(take(&mut at, 4)?.try_into().expect("4 bytes"));
            indexes.push(SecondaryIndex { field, unique, root });
        }

        Ok(Self {
            name,
            key_type,
            schema_version,
            doc_count,
            primary_root,
            data_head,
            data_tail,
            indexes,
        })
    }
}

/// In-memory view of the catalog page, updated only after the owning
/// transaction commits.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: RwLock<HashMap<String, PageId>>,
}

impl Catalog {
    /// Parse the catalog out of the page-1 image.
    pub fn load(buf: &[u8]) -> Result<Self> {
        let header = PageHeader::read(buf)?;
        if header.page_type != PageType::CollectionCatalog {
            return Err(BliteError::invalid_format("page 1 is not the collection catalog"));
        }

        let mut entries = HashMap::new();
        let mut at = PAGE_HEADER_SIZE;
        let count = usize::from(u16::from_le_bytes([buf[at], buf[at + 1]]));
        at += 2;
        for _ in 0..count {
            if at >= buf.len() {
                return Err(BliteError::invalid_format("catalog page truncated"));
            }
            let name_len = usize::from(buf[at]);
            at += 1;
            if at + name_len + 4 > buf.len() {
                return Err(BliteError::invalid_format("catalog page truncated"));
            }
            let name = String::from_utf8(buf[at..at + name_len].to_vec())
                .map_err(|_| BliteError::invalid_format("catalog name is not UTF-8"))?;
            at += name_len;
            let meta_page = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            at += 4;
            entries.insert(name, meta_page);
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Metadata page of a collection.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<PageId> {
        self.entries.read().get(name).copied()
    }

    /// Sorted collection names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Catalog page image with `name → meta_page` added.
    pub fn encode_with(&self, name: &str, meta_page: PageId, page_size: usize) -> Result<Vec<u8>> {
        let mut entries: Vec<(String, PageId)> = self
            .entries
            .read()
            .iter()
            .map(|(n, p)| (n.clone(), *p))
            .collect();
        entries.push((name.to_owned(), meta_page));
        Self::encode_entries(&mut entries, page_size)
    }

    /// Catalog page image with `name` removed.
    pub fn encode_without(&self, name: &str, page_size: usize) -> Result<Vec<u8>> {
        let mut entries: Vec<(String, PageId)> = self
            .entries
            .read()
            .iter()
            .filter(|(n, _)| n.as_str() != name)
            .map(|(n, p)| (n.clone(), *p))
            .collect();
        Self::encode_entries(&mut entries, page_size)
    }

    fn encode_entries(entries: &mut [(String, PageId)], page_size: usize) -> Result<Vec<u8>> {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut buf = vec![0_u8; page_size];
        PageHeader::new(CATALOG_PAGE_ID, PageType::CollectionCatalog).write(&mut buf);

        let mut at = PAGE_HEADER_SIZE;
        buf[at..at + 2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        at += 2;
        for (name, meta_page) in entries.iter() {
            let name = name.as_bytes();
            if name.len() > u8::MAX as usize {
                return Err(BliteError::invalid_format("collection name longer than 255 bytes"));
            }
            if at + 1 + name.len() + 4 > page_size {
                return Err(BliteError::invalid_format("collection catalog is full"));
            }
            buf[at] = name.len() as u8;
            at += 1;
            buf[at..at + name.len()].copy_from_slice(name);
            at += name.len();
            buf[at..at + 4].copy_from_slice(&meta_page.to_le_bytes());
            at += 4;
        }
        Ok(buf)
    }

    /// Install a committed catalog mutation in the in-memory view.
    pub fn apply_insert(&self, name: &str, meta_page: PageId) {
        self.entries.write().insert(name.to_owned(), meta_page);
    }

    /// Remove a committed catalog mutation from the in-memory view.
    pub fn apply_remove(&self, name: &str) {
        self.entries.write().remove(name);
    }
}
