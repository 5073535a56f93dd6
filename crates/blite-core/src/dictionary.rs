//! Field-name dictionary persistence.
//!
//! The in-memory [`FieldSchema`] is the authority; this module loads it
//! from the Dictionary page chain at open and rewrites the chain inside
//! any transaction that interned new names. The chain root lives in the
//! file header. A schema generation is only marked durable after the
//! carrying transaction commits, so an abort simply re-persists next time.

use std::sync::atomic::{AtomicU64, Ordering};

use blite_bson::{Document, FieldEntry, FieldSchema};
use blite_error::{BliteError, Result};
use blite_pager::{PageFile, PageHeader};
use blite_txn::Transaction;
use blite_types::{Cx, NO_PAGE, PAGE_HEADER_SIZE, PageId, PageType, TxnId};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Database-scoped schema with its persistence bookkeeping.
#[derive(Debug)]
pub struct Dictionary {
    schema: RwLock<FieldSchema>,
    /// Highest schema generation known to be on committed pages.
    durable_generation: AtomicU64,
    /// Generations written into still-uncommitted transactions. Only a
    /// commit promotes them to durable; an abort just drops the note so
    /// the next writer re-persists.
    pending: Mutex<HashMap<TxnId, u64>>,
    /// Current page chain, head first.
    chain: Mutex<Vec<PageId>>,
}

impl Dictionary {
    /// Load the schema from the Dictionary chain rooted in the file
    /// header. An empty root yields an empty schema.
    pub fn load(cx: &Cx, page_file: &PageFile) -> Result<Self> {
        let mut schema = FieldSchema::new();
        let mut chain = Vec::new();
        let mut page_id = page_file.dictionary_root();
        while page_id != NO_PAGE {
            let buf = page_file.read(cx, page_id)?;
            let header = PageHeader::read(&buf)?;
            if header.page_type != PageType::Dictionary {
                return Err(BliteError::invalid_format(format!(
                    "dictionary chain page {page_id} is {:?}",
                    header.page_type
                )));
            }
            for entry in decode_entries(&buf)? {
                schema.load_entry(entry)?;
            }
            chain.push(page_id);
            page_id = header.next_page_id;
        }
        debug!(fields = schema.len(), pages = chain.len(), "loaded field dictionary");
        Ok(Self {
            schema: RwLock::new(schema),
            durable_generation: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            chain: Mutex::new(chain),
        })
    }

    /// Run `f` against the schema under a read lock.
    pub fn with_schema<R>(&self, f: impl FnOnce(&FieldSchema) -> R) -> R {
        f(&self.schema.read())
    }

    /// Intern every field name in `doc`, assigning fresh ids on first use.
    pub fn intern_document(&self, doc: &Document) -> Result<()> {
        self.schema.write().intern_document(doc)
    }

    /// Intern one name (secondary-index fields are interned up front so
    /// key extraction by id stays possible).
    pub fn intern(&self, name: &str, bson_type: u8) -> Result<u16> {
        self.schema.write().intern(name, bson_type)
    }

    /// Current schema generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.schema.read().generation()
    }

    /// If the schema moved past the durable generation, rewrite the
    /// Dictionary chain into `txn`. The covered generation is noted
    /// against the transaction and promoted by [`Dictionary::on_commit`].
    pub fn persist_into(&self, cx: &Cx, txn: &mut Transaction) -> Result<()> {
        let (entries, generation) = {
            let schema = self.schema.read();
            (schema.entries(), schema.generation())
        };
        if generation == self.durable_generation.load(Ordering::Acquire) {
            return Ok(());
        }

        let page_file = std::sync::Arc::clone(txn.manager().page_file());
        let page_size = page_file.page_size();
        let bodies = pack_entries(&entries, page_size)?;

        let mut chain = self.chain.lock();
        while chain.len() < bodies.len() {
            chain.push(page_file.allocate_page(cx, PageType::Dictionary)?);
        }
        // A shrinking chain cannot happen (ids are never removed), so the
        // chain length only grows.
        for (pos, body) in bodies.iter().enumerate() {
            let page_id = chain[pos];
            let next = chain.get(pos + 1).copied().unwrap_or(NO_PAGE);
            let mut buf = vec![0_u8; page_size];
            let mut header = PageHeader::new(page_id, PageType::Dictionary);
            header.next_page_id = next;
            header.write(&mut buf);
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + body.len()].copy_from_slice(body);
            txn.add_write(page_id, &buf)?;
        }
        if page_file.dictionary_root() != chain[0] {
            page_file.set_dictionary_root(cx, chain[0])?;
        }
        self.pending.lock().insert(txn.id(), generation);
        debug!(generation, pages = bodies.len(), "dictionary chain queued for commit");
        Ok(())
    }

    /// Promote the generation carried by a now-durable transaction.
    pub fn on_commit(&self, txn_id: TxnId) {
        if let Some(generation) = self.pending.lock().remove(&txn_id) {
            self.durable_generation.fetch_max(generation, Ordering::Release);
        }
    }

    /// Forget the note for an aborted transaction; the chain on disk may
    /// be stale, so the next persisting writer rewrites it.
    pub fn on_abort(&self, txn_id: TxnId) {
        self.pending.lock().remove(&txn_id);
    }
}

/// Pack dictionary entries into page bodies:
/// `count(u16) , { field_id(u16), name_len(u8), name, bson_type(u8) }*`.
fn pack_entries(entries: &[FieldEntry], page_size: usize) -> Result<Vec<Vec<u8>>> {
    let capacity = page_size - PAGE_HEADER_SIZE;
    let mut bodies = Vec::new();
    let mut current = vec![0_u8; 2];
    let mut count: u16 = 0;

    for entry in entries {
        let name = entry.name.as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(BliteError::invalid_format("field name longer than 255 bytes"));
        }
        let needed = 2 + 1 + name.len() + 1;
        if current.len() + needed > capacity {
            current[..2].copy_from_slice(&count.to_le_bytes());
            bodies.push(current);
            current = vec![0_u8; 2];
            count = 0;
        }
        current.extend_from_slice(&entry.id.to_le_bytes());
        current.push(name.len() as u8);
        current.extend_from_slice(name);
        current.push(entry.bson_type);
        count += 1;
    }
    current[..2].copy_from_slice(&count.to_le_bytes());
    bodies.push(current);
    Ok(bodies)
}

/// Parse the entries of one Dictionary page image.
fn decode_entries(buf: &[u8]) -> Result<Vec<FieldEntry>> {
    let mut at = PAGE_HEADER_SIZE;
    if at + 2 > buf.len() {
        return Err(BliteError::invalid_format("dictionary page truncated"));
    }
    let count = usize::from(u16::from_le_bytes([buf[at], buf[at + 1]]));
    at += 2;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if at + 3 > buf.len() {
            return Err(BliteError::invalid_format("dictionary entry truncated"));
        }
        let id = u16::from_le_bytes([buf[at], buf[at + 1]]);
        let name_len = usize::from(buf[at + 2]);
        at += 3;
        if at + name_len + 1 > buf.len() {
            return Err(BliteError::invalid_format("dictionary entry truncated"));
        }
        let name = String::from_utf8(buf[at..at + name_len].to_vec())
            .map_err(|_| BliteError::invalid_format("field name is not UTF-8"))?;
        at += name_len;
        let bson_type = buf[at];
        at += 1;
        entries.push(FieldEntry { id, name, bson_type });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_decode_entries() {
        let entries: Vec<FieldEntry> = (0..10)
            .map(|i| FieldEntry {
                id: 5000 + i,
                name: format!("field_{i}"),
                bson_type: 0x10,
            })
            .collect();
        let bodies = pack_entries(&entries, 8192).unwrap();
        assert_eq!(bodies.len(), 1);

        let mut buf = vec![0_u8; 8192];
        PageHeader::new(4, PageType::Dictionary).write(&mut buf);
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bodies[0].len()].copy_from_slice(&bodies[0]);
        let decoded = decode_entries(&buf).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_pack_spills_to_multiple_pages() {
        // 8192-byte pages hold ~2000 short entries; 3000 needs two pages.
        let entries: Vec<FieldEntry> = (0..3000_u16)
            .map(|i| FieldEntry {
                id: 5000 + i,
                name: format!("f{i}"),
                bson_type: 0x02,
            })
            .collect();
        let bodies = pack_entries(&entries, 8192).unwrap();
        assert!(bodies.len() >= 2);
        let total: usize = bodies
            .iter()
            .map(|body| usize::from(u16::from_le_bytes([body[0], body[1]])))
            .sum();
        assert_eq!(total, 3000);
    }
}
