//! Collection manager: document placement, primary and secondary index
//! maintenance, scans, and the implicit-transaction convenience layer.

use std::sync::Arc;

use blite_bson::{BsonValue, Document, FieldSchema};
use blite_btree::{BTree, Node};
use blite_error::{BliteError, Result};
use blite_pager::{SlottedPage, UpdateOutcome, overflow};
use blite_txn::{ChangeOp, IsolationLevel, PendingChange, Transaction};
use blite_types::{Cx, DocumentLocation, IndexKey, NO_PAGE, PageId, PageType};
use tracing::{debug, info};

use crate::catalog::{CollectionMeta, SecondaryIndex};
use crate::db::CoreState;
use crate::mapper::DocumentMapper;
use crate::watch::Subscription;

/// Handle to one collection. Cheap to clone; all handles share the
/// database core.
#[derive(Clone)]
pub struct Collection {
    core: Arc<CoreState>,
    name: String,
    meta_page: PageId,
    mapper: Arc<dyn DocumentMapper>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("meta_page", &self.meta_page)
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub(crate) fn open(
        core: Arc<CoreState>,
        name: String,
        meta_page: PageId,
        mapper: Arc<dyn DocumentMapper>,
    ) -> Self {
        Self {
            core,
            name,
            meta_page,
            mapper,
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live-document count.
    pub fn count(&self, cx: &Cx) -> Result<u64> {
        Ok(self.load_meta(cx, None)?.doc_count)
    }

    /// Subscribe to this collection's post-commit change feed.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.core.dispatcher.subscribe(&self.name)
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Insert a document, assigning an ObjectId when the id slot is empty.
    /// Without `txn`, an implicit transaction covers the single operation.
    pub fn insert(
        &self,
        cx: &Cx,
        doc: Document,
        txn: Option<&mut Transaction>,
    ) -> Result<BsonValue> {
        match txn {
            Some(txn) => self.insert_in(cx, txn, doc),
            None => self.with_implicit_txn(cx, |txn| self.insert_in(cx, txn, doc)),
        }
    }

    /// Insert a batch under one transaction. A failure anywhere aborts the
    /// whole batch.
    pub fn insert_bulk<I>(&self, cx: &Cx, docs: I, txn: Option<&mut Transaction>) -> Result<Vec<BsonValue>>
    where
        I: IntoIterator<Item = Document>,
    {
        match txn {
            Some(txn) => docs.into_iter().map(|doc| self.insert_in(cx, txn, doc)).collect(),
            None => self.with_implicit_txn(cx, |txn| {
                docs.into_iter().map(|doc| self.insert_in(cx, txn, doc)).collect()
            }),
        }
    }

    fn insert_in(&self, cx: &Cx, txn: &mut Transaction, mut doc: Document) -> Result<BsonValue> {
        let id = match self.mapper.get_id(&doc) {
            Some(id) => id,
            None => {
                let id = BsonValue::ObjectId(blite_types::ObjectId::new());
                self.mapper.set_id(&mut doc, id.clone());
                id
            }
        };
        let key = primary_key(&id)?;

        self.core.dictionary.intern_document(&doc)?;
        self.core.dictionary.persist_into(cx, txn)?;
        let bytes = self.encode_doc(&doc)?;

        let mut meta = self.load_meta(cx, Some(txn))?;
        let primary = self.primary_tree(&meta);
        if primary.seek(cx, &self.core.txn_mgr, Some(txn), &key)?.is_some() {
            return Err(BliteError::DuplicateKey {
                index: primary.name().to_owned(),
            });
        }

        let loc = self.place_document(cx, txn, &mut meta, &bytes)?;
        primary.insert(cx, txn, &key, loc)?;
        for index in &meta.indexes {
            self.secondary_insert(cx, txn, index, &doc, loc)?;
        }

        meta.doc_count += 1;
        meta.schema_version = self.core.dictionary.generation();
        self.store_meta(txn, &meta)?;

        txn.add_change(PendingChange {
            collection: self.name.clone(),
            op: ChangeOp::Insert,
            doc_id: id.clone(),
            after: Some(Arc::new(bytes)),
            location: loc,
        })?;
        debug!(collection = %self.name, txn_id = txn.id(), "document inserted");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Primary-key point lookup.
    pub fn get(&self, cx: &Cx, id: &BsonValue, txn: Option<&Transaction>) -> Result<Option<Document>> {
        let key = primary_key(id)?;
        let meta = self.load_meta(cx, txn)?;
        let primary = self.primary_tree(&meta);
        let Some(loc) = primary.seek(cx, &self.core.txn_mgr, txn, &key)? else {
            return Ok(None);
        };
        let bytes = self.read_document_bytes(cx, txn, loc)?;
        let doc = self
            .core
            .dictionary
            .with_schema(|schema| self.mapper.decode(&bytes, schema))?;
        Ok(Some(doc))
    }

    /// Raw encoded bytes of the document at `id`, if present.
    pub fn get_raw(&self, cx: &Cx, id: &BsonValue, txn: Option<&Transaction>) -> Result<Option<Vec<u8>>> {
        let key = primary_key(id)?;
        let meta = self.load_meta(cx, txn)?;
        let Some(loc) = self.primary_tree(&meta).seek(cx, &self.core.txn_mgr, txn, &key)? else {
            return Ok(None);
        };
        Ok(Some(self.read_document_bytes(cx, txn, loc)?))
    }

    /// Walk every live slot of the collection. The predicate sees the
    /// schema and the raw encoded bytes (use [`blite_bson::scan`] inside
    /// it to test fields without materializing); only matching documents
    /// are decoded.
    pub fn scan<F>(&self, cx: &Cx, txn: Option<&Transaction>, mut predicate: F) -> Result<Vec<Document>>
    where
        F: FnMut(&FieldSchema, &[u8]) -> Result<bool>,
    {
        let meta = self.load_meta(cx, txn)?;
        let mut out = Vec::new();
        let mut page_id = meta.data_head;
        while page_id != NO_PAGE {
            let buf = self.core.txn_mgr.read_page(cx, txn, page_id)?;
            let page = SlottedPage::from_bytes(buf.as_ref().clone())?;
            for slot_index in page.live_slots()? {
                let slot = page.slot(slot_index)?;
                let bytes = if slot.has_overflow() {
                    self.assemble_overflow(cx, txn, page.read(slot_index)?)?
                } else {
                    page.read(slot_index)?.to_vec()
                };
                let matched = self
                    .core
                    .dictionary
                    .with_schema(|schema| predicate(schema, &bytes))?;
                if matched {
                    out.push(
                        self.core
                            .dictionary
                            .with_schema(|schema| self.mapper.decode(&bytes, schema))?,
                    );
                }
            }
            page_id = page.next_page_id();
        }
        Ok(out)
    }

    /// Every document, in data-page order.
    pub fn scan_all(&self, cx: &Cx, txn: Option<&Transaction>) -> Result<Vec<Document>> {
        self.scan(cx, txn, |_, _| Ok(true))
    }

    /// Primary-index range scan, both bounds inclusive, `None` open-ended.
    pub fn range(
        &self,
        cx: &Cx,
        min: Option<&BsonValue>,
        max: Option<&BsonValue>,
        txn: Option<&Transaction>,
    ) -> Result<Vec<Document>> {
        let min_key = min.map(primary_key).transpose()?;
        let max_key = max.map(primary_key).transpose()?;
        let meta = self.load_meta(cx, txn)?;
        let primary = self.primary_tree(&meta);

        let locations: Vec<DocumentLocation> = primary
            .range(cx, &self.core.txn_mgr, txn, min_key.as_ref(), max_key.as_ref())?
            .map(|entry| entry.map(|(_, loc)| loc))
            .collect::<Result<_>>()?;

        let mut out = Vec::with_capacity(locations.len());
        for loc in locations {
            let bytes = self.read_document_bytes(cx, txn, loc)?;
            out.push(
                self.core
                    .dictionary
                    .with_schema(|schema| self.mapper.decode(&bytes, schema))?,
            );
        }
        Ok(out)
    }

    /// Documents matching `value` on a declared secondary index.
    pub fn find_by_index(
        &self,
        cx: &Cx,
        field: &str,
        value: &BsonValue,
        txn: Option<&Transaction>,
    ) -> Result<Vec<Document>> {
        let meta = self.load_meta(cx, txn)?;
        let index = meta
            .indexes
            .iter()
            .find(|index| index.field == field)
            .ok_or_else(|| BliteError::not_found(format!("index on {}.{field}", self.name)))?;
        let Some(user_key) = value_key(value) else {
            return Ok(Vec::new());
        };
        let tree = self.secondary_tree(index);
        let mut out = Vec::new();
        for loc in tree.find_all(cx, &self.core.txn_mgr, txn, &user_key)? {
            let bytes = self.read_document_bytes(cx, txn, loc)?;
            out.push(
                self.core
                    .dictionary
                    .with_schema(|schema| self.mapper.decode(&bytes, schema))?,
            );
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Update / delete
    // -----------------------------------------------------------------------

    /// Replace the document stored under `id`. In place when the new
    /// encoding fits the old slot, relocating (and rewriting index
    /// entries) otherwise.
    pub fn update(
        &self,
        cx: &Cx,
        id: &BsonValue,
        doc: Document,
        txn: Option<&mut Transaction>,
    ) -> Result<()> {
        match txn {
            Some(txn) => self.update_in(cx, txn, id, doc),
            None => self.with_implicit_txn(cx, |txn| self.update_in(cx, txn, id, doc)),
        }
    }

    fn update_in(&self, cx: &Cx, txn: &mut Transaction, id: &BsonValue, mut doc: Document) -> Result<()> {
        let key = primary_key(id)?;
        self.mapper.set_id(&mut doc, id.clone());

        self.core.dictionary.intern_document(&doc)?;
        self.core.dictionary.persist_into(cx, txn)?;
        let new_bytes = self.encode_doc(&doc)?;

        let mut meta = self.load_meta(cx, Some(txn))?;
        let primary = self.primary_tree(&meta);
        let Some(old_loc) = primary.seek(cx, &self.core.txn_mgr, Some(txn), &key)? else {
            return Err(BliteError::not_found(format!("{}[{id:?}]", self.name)));
        };

        let old_bytes = self.read_document_bytes(cx, Some(txn), old_loc)?;
        let old_doc = self
            .core
            .dictionary
            .with_schema(|schema| self.mapper.decode(&old_bytes, schema))?;

        let page_buf = txn.read_page(cx, old_loc.page_id)?;
        let mut page = SlottedPage::from_bytes(page_buf.as_ref().clone())?;
        let old_slot = page.slot(old_loc.slot)?;

        let new_loc = if old_slot.has_overflow() || new_bytes.len() > usize::from(old_slot.length) {
            // Relocation path: retire the old slot (and any chain), place
            // the new encoding wherever it fits.
            if old_slot.has_overflow() {
                self.defer_free_overflow_chain(cx, txn, page.read(old_loc.slot)?)?;
            }
            page.delete(old_loc.slot)?;
            page.set_txn_id(txn.id());
            txn.add_write(old_loc.page_id, page.as_bytes())?;
            self.place_document(cx, txn, &mut meta, &new_bytes)?
        } else {
            match page.update(old_loc.slot, &new_bytes)? {
                UpdateOutcome::InPlace => {
                    page.set_txn_id(txn.id());
                    txn.add_write(old_loc.page_id, page.as_bytes())?;
                    old_loc
                }
                UpdateOutcome::NeedsRelocation => {
                    page.set_txn_id(txn.id());
                    txn.add_write(old_loc.page_id, page.as_bytes())?;
                    self.place_document(cx, txn, &mut meta, &new_bytes)?
                }
            }
        };

        if new_loc != old_loc {
            primary.remove(cx, txn, &key)?;
            primary.insert(cx, txn, &key, new_loc)?;
        }
        for index in &meta.indexes {
            self.secondary_update(cx, txn, index, &old_doc, old_loc, &doc, new_loc)?;
        }

        meta.schema_version = self.core.dictionary.generation();
        self.store_meta(txn, &meta)?;
        txn.add_change(PendingChange {
            collection: self.name.clone(),
            op: ChangeOp::Update,
            doc_id: id.clone(),
            after: Some(Arc::new(new_bytes)),
            location: new_loc,
        })?;
        Ok(())
    }

    /// Delete the document stored under `id`.
    pub fn delete(&self, cx: &Cx, id: &BsonValue, txn: Option<&mut Transaction>) -> Result<()> {
        match txn {
            Some(txn) => self.delete_in(cx, txn, id),
            None => self.with_implicit_txn(cx, |txn| self.delete_in(cx, txn, id)),
        }
    }

    fn delete_in(&self, cx: &Cx, txn: &mut Transaction, id: &BsonValue) -> Result<()> {
        let key = primary_key(id)?;
        let mut meta = self.load_meta(cx, Some(txn))?;
        let primary = self.primary_tree(&meta);
        let Some(loc) = primary.seek(cx, &self.core.txn_mgr, Some(txn), &key)? else {
            return Err(BliteError::not_found(format!("{}[{id:?}]", self.name)));
        };

        let old_bytes = self.read_document_bytes(cx, Some(txn), loc)?;
        let old_doc = self
            .core
            .dictionary
            .with_schema(|schema| self.mapper.decode(&old_bytes, schema))?;

        let page_buf = txn.read_page(cx, loc.page_id)?;
        let mut page = SlottedPage::from_bytes(page_buf.as_ref().clone())?;
        if page.slot(loc.slot)?.has_overflow() {
            self.defer_free_overflow_chain(cx, txn, page.read(loc.slot)?)?;
        }
        page.delete(loc.slot)?;
        page.set_txn_id(txn.id());
        txn.add_write(loc.page_id, page.as_bytes())?;

        primary.remove(cx, txn, &key)?;
        for index in &meta.indexes {
            self.secondary_remove(cx, txn, index, &old_doc, loc)?;
        }

        meta.doc_count = meta.doc_count.saturating_sub(1);
        self.store_meta(txn, &meta)?;
        txn.add_change(PendingChange {
            collection: self.name.clone(),
            op: ChangeOp::Delete,
            doc_id: id.clone(),
            after: None,
            location: loc,
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Secondary indexes
    // -----------------------------------------------------------------------

    /// Declare (and backfill) a secondary index over `field`. Idempotent
    /// when the same declaration already exists.
    pub fn ensure_index(&self, cx: &Cx, field: &str, unique: bool) -> Result<()> {
        let meta = self.load_meta(cx, None)?;
        if let Some(existing) = meta.indexes.iter().find(|index| index.field == field) {
            if existing.unique == unique {
                return Ok(());
            }
            return Err(BliteError::Exists {
                name: format!("{}.{field}", self.name),
            });
        }

        self.core.dictionary.intern(field, 0)?;
        self.with_implicit_txn(cx, |txn| {
            let mut meta = self.load_meta(cx, Some(txn))?;
            let root = BTree::create_root(cx, txn)?;
            let index = SecondaryIndex {
                field: field.to_owned(),
                unique,
                root,
            };

            // Backfill from every live document.
            let mut page_id = meta.data_head;
            while page_id != NO_PAGE {
                let buf = self.core.txn_mgr.read_page(cx, Some(txn), page_id)?;
                let page = SlottedPage::from_bytes(buf.as_ref().clone())?;
                for slot_index in page.live_slots()? {
                    let slot = page.slot(slot_index)?;
                    let bytes = if slot.has_overflow() {
                        self.assemble_overflow(cx, Some(txn), page.read(slot_index)?)?
                    } else {
                        page.read(slot_index)?.to_vec()
                    };
                    let doc = self
                        .core
                        .dictionary
                        .with_schema(|schema| self.mapper.decode(&bytes, schema))?;
                    self.secondary_insert(cx, txn, &index, &doc, DocumentLocation::new(page_id, slot_index))?;
                }
                page_id = page.next_page_id();
            }

            meta.indexes.push(index);
            self.store_meta(txn, &meta)?;
            self.core.dictionary.persist_into(cx, txn)?;
            info!(collection = %self.name, field, unique, "secondary index created");
            Ok(())
        })
    }

    /// Drop a secondary index and reclaim its pages.
    pub fn drop_index(&self, cx: &Cx, field: &str) -> Result<()> {
        self.with_implicit_txn(cx, |txn| {
            let mut meta = self.load_meta(cx, Some(txn))?;
            let pos = meta
                .indexes
                .iter()
                .position(|index| index.field == field)
                .ok_or_else(|| BliteError::not_found(format!("index on {}.{field}", self.name)))?;
            let index = meta.indexes.remove(pos);
            for page_id in self.collect_tree_pages(cx, Some(txn), index.root)? {
                txn.defer_free(page_id)?;
            }
            self.store_meta(txn, &meta)?;
            info!(collection = %self.name, field, "secondary index dropped");
            Ok(())
        })
    }

    /// Declared secondary indexes.
    pub fn indexes(&self, cx: &Cx) -> Result<Vec<SecondaryIndex>> {
        Ok(self.load_meta(cx, None)?.indexes)
    }

    fn secondary_insert(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        index: &SecondaryIndex,
        doc: &Document,
        loc: DocumentLocation,
    ) -> Result<()> {
        let Some(user_key) = doc.get(&index.field).and_then(value_key) else {
            return Ok(());
        };
        let tree = self.secondary_tree(index);
        let key = if index.unique { user_key } else { user_key.composite(loc) };
        tree.insert(cx, txn, &key, loc)
    }

    fn secondary_remove(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        index: &SecondaryIndex,
        doc: &Document,
        loc: DocumentLocation,
    ) -> Result<()> {
        let Some(user_key) = doc.get(&index.field).and_then(value_key) else {
            return Ok(());
        };
        let tree = self.secondary_tree(index);
        let key = if index.unique { user_key } else { user_key.composite(loc) };
        tree.remove(cx, txn, &key)?;
        Ok(())
    }

    fn secondary_update(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        index: &SecondaryIndex,
        old_doc: &Document,
        old_loc: DocumentLocation,
        new_doc: &Document,
        new_loc: DocumentLocation,
    ) -> Result<()> {
        let old_value = old_doc.get(&index.field);
        let new_value = new_doc.get(&index.field);
        if old_value == new_value && old_loc == new_loc {
            return Ok(());
        }
        self.secondary_remove(cx, txn, index, old_doc, old_loc)?;
        self.secondary_insert(cx, txn, index, new_doc, new_loc)
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    fn place_document(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        meta: &mut CollectionMeta,
        bytes: &[u8],
    ) -> Result<DocumentLocation> {
        let page_size = self.core.page_file.page_size();
        if bytes.len() > SlottedPage::usable_capacity(page_size) {
            return self.place_overflow(cx, txn, meta, bytes);
        }

        // Try the chain tail first; open a fresh Data page otherwise.
        if meta.data_tail != NO_PAGE {
            let buf = txn.read_page(cx, meta.data_tail)?;
            let mut page = SlottedPage::from_bytes(buf.as_ref().clone())?;
            if page.can_fit(bytes.len()) {
                let slot = page.insert(bytes)?;
                page.set_txn_id(txn.id());
                txn.add_write(meta.data_tail, page.as_bytes())?;
                return Ok(DocumentLocation::new(meta.data_tail, slot));
            }
        }

        let page_id = self.core.page_file.allocate_page(cx, PageType::Data)?;
        let mut page = SlottedPage::new(page_id, page_size);
        let slot = page.insert(bytes)?;
        page.set_txn_id(txn.id());
        txn.add_write(page_id, page.as_bytes())?;
        self.link_data_page(cx, txn, meta, page_id)?;
        Ok(DocumentLocation::new(page_id, slot))
    }

    /// Oversized documents: as much as fits stays inline in a fresh Data
    /// slot behind a stub; the rest goes to a chain of Overflow pages.
    fn place_overflow(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        meta: &mut CollectionMeta,
        bytes: &[u8],
    ) -> Result<DocumentLocation> {
        let page_size = self.core.page_file.page_size();
        let inline_len = SlottedPage::usable_capacity(page_size) - overflow::STUB_PREFIX_LEN;
        let chunk_cap = overflow::chunk_capacity(page_size);
        let (inline, rest) = bytes.split_at(inline_len);

        let chunks: Vec<&[u8]> = rest.chunks(chunk_cap).collect();
        let mut chain = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            chain.push(self.core.page_file.allocate_page(cx, PageType::Overflow)?);
        }
        for (pos, chunk) in chunks.iter().enumerate() {
            let next = chain.get(pos + 1).copied().unwrap_or(NO_PAGE);
            let mut buf = vec![0_u8; page_size];
            overflow::write_chunk(&mut buf, chain[pos], next, chunk)?;
            txn.add_write(chain[pos], &buf)?;
        }

        let stub = overflow::encode_stub(bytes.len() as u32, chain[0], inline);
        let page_id = self.core.page_file.allocate_page(cx, PageType::Data)?;
        let mut page = SlottedPage::new(page_id, page_size);
        let slot = page.insert_with_flags(&stub, blite_types::SlotFlags::HAS_OVERFLOW)?;
        page.set_txn_id(txn.id());
        txn.add_write(page_id, page.as_bytes())?;
        self.link_data_page(cx, txn, meta, page_id)?;
        debug!(collection = %self.name, pages = chain.len(), "document spilled to overflow chain");
        Ok(DocumentLocation::new(page_id, slot))
    }

    fn link_data_page(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        meta: &mut CollectionMeta,
        page_id: PageId,
    ) -> Result<()> {
        if meta.data_head == NO_PAGE {
            meta.data_head = page_id;
        } else {
            let buf = txn.read_page(cx, meta.data_tail)?;
            let mut tail = SlottedPage::from_bytes(buf.as_ref().clone())?;
            tail.set_next_page_id(page_id);
            txn.add_write(meta.data_tail, tail.as_bytes())?;
        }
        meta.data_tail = page_id;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Byte-level access
    // -----------------------------------------------------------------------

    fn read_document_bytes(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
        loc: DocumentLocation,
    ) -> Result<Vec<u8>> {
        let buf = self.core.txn_mgr.read_page(cx, txn, loc.page_id)?;
        let page = SlottedPage::from_bytes(buf.as_ref().clone())?;
        let slot = page.slot(loc.slot)?;
        let bytes = page.read(loc.slot)?;
        if slot.has_overflow() {
            self.assemble_overflow(cx, txn, bytes)
        } else {
            Ok(bytes.to_vec())
        }
    }

    fn assemble_overflow(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
        stub_bytes: &[u8],
    ) -> Result<Vec<u8>> {
        let stub = overflow::decode_stub(stub_bytes)?;
        let mut out = Vec::with_capacity(stub.total_len as usize);
        out.extend_from_slice(stub.inline);
        let mut page_id = stub.head_page;
        while page_id != NO_PAGE {
            let buf = self.core.txn_mgr.read_page(cx, txn, page_id)?;
            let (chunk, next) = overflow::read_chunk(&buf)?;
            out.extend_from_slice(chunk);
            page_id = next;
        }
        if out.len() != stub.total_len as usize {
            return Err(BliteError::malformed(format!(
                "overflow chain yielded {} bytes, stub declared {}",
                out.len(),
                stub.total_len
            )));
        }
        Ok(out)
    }

    fn defer_free_overflow_chain(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        stub_bytes: &[u8],
    ) -> Result<()> {
        let stub = overflow::decode_stub(stub_bytes)?;
        let mut page_id = stub.head_page;
        while page_id != NO_PAGE {
            let buf = self.core.txn_mgr.read_page(cx, Some(txn), page_id)?;
            let (_, next) = overflow::read_chunk(&buf)?;
            txn.defer_free(page_id)?;
            page_id = next;
        }
        Ok(())
    }

    /// Every page of the tree rooted at `root` (for index teardown).
    pub(crate) fn collect_tree_pages(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
        root: PageId,
    ) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        let mut frontier = vec![root];
        while let Some(page_id) = frontier.pop() {
            out.push(page_id);
            let node = Node::decode(&self.core.txn_mgr.read_page(cx, txn, page_id)?)?;
            if !node.is_leaf {
                frontier.push(node.leftmost_child());
                for (_, payload) in &node.entries {
                    frontier.push(payload.child()?);
                }
            }
        }
        Ok(out)
    }

    /// Data-page chain plus every overflow chain hanging off it (for
    /// collection teardown).
    pub(crate) fn collect_data_pages(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
        meta: &CollectionMeta,
    ) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        let mut page_id = meta.data_head;
        while page_id != NO_PAGE {
            out.push(page_id);
            let buf = self.core.txn_mgr.read_page(cx, txn, page_id)?;
            let page = SlottedPage::from_bytes(buf.as_ref().clone())?;
            for slot_index in page.live_slots()? {
                if page.slot(slot_index)?.has_overflow() {
                    let stub = overflow::decode_stub(page.read(slot_index)?)?;
                    let mut overflow_id = stub.head_page;
                    while overflow_id != NO_PAGE {
                        out.push(overflow_id);
                        let obuf = self.core.txn_mgr.read_page(cx, txn, overflow_id)?;
                        let (_, next) = overflow::read_chunk(&obuf)?;
                        overflow_id = next;
                    }
                }
            }
            page_id = page.next_page_id();
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn load_meta(&self, cx: &Cx, txn: Option<&Transaction>) -> Result<CollectionMeta> {
        CollectionMeta::decode_page(&self.core.txn_mgr.read_page(cx, txn, self.meta_page)?)
    }

    fn store_meta(&self, txn: &mut Transaction, meta: &CollectionMeta) -> Result<()> {
        let page_size = self.core.page_file.page_size();
        txn.add_write(self.meta_page, &meta.encode_page(self.meta_page, page_size)?)
    }

    fn primary_tree(&self, meta: &CollectionMeta) -> BTree {
        BTree::new(
            meta.primary_root,
            true,
            format!("{}._id", self.name),
            self.core.page_file.page_size(),
        )
    }

    fn secondary_tree(&self, index: &SecondaryIndex) -> BTree {
        BTree::new(
            index.root,
            index.unique,
            format!("{}.{}", self.name, index.field),
            self.core.page_file.page_size(),
        )
    }

    fn encode_doc(&self, doc: &Document) -> Result<Vec<u8>> {
        self.core.dictionary.with_schema(|schema| {
            let len = self.mapper.encoded_len(doc, schema)?;
            if len > self.core.options.max_document_bytes {
                return Err(BliteError::DocumentTooLarge {
                    size: len,
                    limit: self.core.options.max_document_bytes,
                });
            }
            let mut buf = vec![0_u8; len];
            let written = self.mapper.encode(doc, schema, &mut buf)?;
            buf.truncate(written);
            Ok(buf)
        })
    }

    fn with_implicit_txn<R>(
        &self,
        cx: &Cx,
        body: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let mut txn = self
            .core
            .txn_mgr
            .begin(cx, IsolationLevel::ReadCommitted)?;
        match body(&mut txn) {
            Ok(value) => {
                self.core.commit(cx, txn)?;
                Ok(value)
            }
            Err(err) => {
                self.core.rollback(cx, txn);
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

/// Primary-key encoding for the id value.
pub(crate) fn primary_key(id: &BsonValue) -> Result<IndexKey> {
    value_key(id).ok_or_else(|| {
        BliteError::malformed(format!(
            "type {:#04x} cannot be a primary key",
            id.type_code()
        ))
    })
}

/// Order-preserving key encoding for indexable values. `None` for types
/// the index layer does not order (doubles, blobs, nested documents).
pub(crate) fn value_key(value: &BsonValue) -> Option<IndexKey> {
    match value {
        BsonValue::Int32(v) => Some(IndexKey::from_i32(*v)),
        BsonValue::Int64(v) => Some(IndexKey::from_i64(*v)),
        BsonValue::String(v) => Some(IndexKey::from_str_key(v)),
        BsonValue::ObjectId(v) => Some(IndexKey::from_object_id(*v)),
        BsonValue::DateTime(v) => Some(IndexKey::from_i64(*v)),
        BsonValue::Boolean(v) => Some(IndexKey::from_bytes(vec![u8::from(*v)])),
        _ => None,
    }
}
