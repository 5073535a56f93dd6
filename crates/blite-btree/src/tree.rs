//! Tree operations: insert with upward split propagation, lazy-underflow
//! remove, point lookups, and leaf-link iteration.
//!
//! The root page id never changes: a root split moves both halves into
//! fresh pages and turns the root into an internal node in place, so the
//! collection metadata that records the root stays valid.

use blite_error::{BliteError, Result};
use blite_txn::{Transaction, TxnManager};
use blite_types::{Cx, DocumentLocation, IndexKey, NO_PAGE, PageId, PageType};
use tracing::debug;

use crate::node::{MAX_KEY_LEN, Node, NodePayload};

/// One B+Tree, identified by its stable root page.
#[derive(Debug, Clone)]
pub struct BTree {
    root: PageId,
    unique: bool,
    name: String,
    page_size: usize,
}

impl BTree {
    /// Handle to an existing tree.
    #[must_use]
    pub fn new(root: PageId, unique: bool, name: impl Into<String>, page_size: usize) -> Self {
        Self {
            root,
            unique,
            name: name.into(),
            page_size,
        }
    }

    /// Allocate and write an empty root leaf inside `txn`.
    pub fn create_root(cx: &Cx, txn: &mut Transaction) -> Result<PageId> {
        let mgr = std::sync::Arc::clone(txn.manager());
        let page_id = mgr.page_file().allocate_page(cx, PageType::Index)?;
        let node = Node::new_leaf(page_id);
        txn.add_write(page_id, &node.encode(mgr.page_file().page_size())?)?;
        Ok(page_id)
    }

    /// Stable root page id.
    #[must_use]
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Index name used in error reporting.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert `key → loc`. Keys are unique at the tree level: callers of
    /// non-unique indexes pass composite `(user_key || location)` keys, so
    /// an exact match always signals a duplicate.
    pub fn insert(&self, cx: &Cx, txn: &mut Transaction, key: &IndexKey, loc: DocumentLocation) -> Result<()> {
        let key = key.as_bytes();
        if key.len() > MAX_KEY_LEN {
            return Err(BliteError::malformed(format!(
                "index key of {} bytes exceeds the {MAX_KEY_LEN}-byte limit",
                key.len()
            )));
        }

        let (mut leaf, path) = self.descend_with_path(cx, Some(txn), key)?;
        if leaf.find_exact(key).is_some() {
            return Err(BliteError::DuplicateKey {
                index: self.name.clone(),
            });
        }

        let pos = leaf.lower_bound(key);
        leaf.entries
            .insert(pos, (key.to_vec(), NodePayload::Location(loc)));
        if leaf.fits(self.page_size) {
            return self.store(txn, &leaf);
        }
        self.split_upward(cx, txn, leaf, path)
    }

    /// Remove the entry for `key`, returning the location it held.
    /// Underflowing nodes are left as they are; background maintenance
    /// merges them.
    pub fn remove(&self, cx: &Cx, txn: &mut Transaction, key: &IndexKey) -> Result<DocumentLocation> {
        let key = key.as_bytes();
        let (mut leaf, _) = self.descend_with_path(cx, Some(txn), key)?;
        let Some(pos) = leaf.find_exact(key) else {
            return Err(BliteError::not_found(format!(
                "key absent from index {}",
                self.name
            )));
        };
        let (_, payload) = leaf.entries.remove(pos);
        self.store(txn, &leaf)?;
        payload.location()
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Unique-key point lookup.
    pub fn seek(
        &self,
        cx: &Cx,
        mgr: &TxnManager,
        txn: Option<&Transaction>,
        key: &IndexKey,
    ) -> Result<Option<DocumentLocation>> {
        let leaf = self.descend(cx, mgr, txn, key.as_bytes())?;
        match leaf.find_exact(key.as_bytes()) {
            Some(pos) => Ok(Some(leaf.entries[pos].1.location()?)),
            None => Ok(None),
        }
    }

    /// Every location stored under `user_key`. For non-unique indexes this
    /// walks the composite-key run that starts with `user_key`.
    pub fn find_all(
        &self,
        cx: &Cx,
        mgr: &TxnManager,
        txn: Option<&Transaction>,
        user_key: &IndexKey,
    ) -> Result<Vec<DocumentLocation>> {
        if self.unique {
            return Ok(self.seek(cx, mgr, txn, user_key)?.into_iter().collect());
        }
        let composite_len = user_key.len() + DocumentLocation::ENCODED_LEN;
        let mut out = Vec::new();
        for entry in self.prefix(cx, mgr, txn, user_key)? {
            let (key, loc) = entry?;
            if key.len() == composite_len {
                out.push(loc);
            }
        }
        Ok(out)
    }

    /// Inclusive range scan; `None` bounds are open-ended.
    pub fn range<'a>(
        &self,
        cx: &Cx,
        mgr: &'a TxnManager,
        txn: Option<&'a Transaction>,
        min: Option<&IndexKey>,
        max: Option<&IndexKey>,
    ) -> Result<EntryIter<'a>> {
        let upper = max.map_or(UpperBound::Unbounded, |key| {
            UpperBound::Inclusive(key.as_bytes().to_vec())
        });
        self.iter_from(cx, mgr, txn, min.map(IndexKey::as_bytes), upper)
    }

    /// Every entry whose key starts with `prefix`, in key order.
    pub fn prefix<'a>(
        &self,
        cx: &Cx,
        mgr: &'a TxnManager,
        txn: Option<&'a Transaction>,
        prefix: &IndexKey,
    ) -> Result<EntryIter<'a>> {
        self.iter_from(
            cx,
            mgr,
            txn,
            Some(prefix.as_bytes()),
            UpperBound::Prefix(prefix.as_bytes().to_vec()),
        )
    }

    fn iter_from<'a>(
        &self,
        cx: &Cx,
        mgr: &'a TxnManager,
        txn: Option<&'a Transaction>,
        min: Option<&[u8]>,
        upper: UpperBound,
    ) -> Result<EntryIter<'a>> {
        let leaf = match min {
            Some(min) => self.descend(cx, mgr, txn, min)?,
            None => self.leftmost_leaf(cx, mgr, txn)?,
        };
        let pos = min.map_or(0, |min| leaf.lower_bound(min));
        Ok(EntryIter {
            mgr,
            txn,
            cx: cx.clone(),
            node: Some(leaf),
            pos,
            upper,
        })
    }

    // -----------------------------------------------------------------------
    // Descent
    // -----------------------------------------------------------------------

    fn load(
        &self,
        cx: &Cx,
        mgr: &TxnManager,
        txn: Option<&Transaction>,
        page_id: PageId,
    ) -> Result<Node> {
        Node::decode(&mgr.read_page(cx, txn, page_id)?)
    }

    fn store(&self, txn: &mut Transaction, node: &Node) -> Result<()> {
        txn.add_write(node.page_id, &node.encode(self.page_size)?)
    }

    fn descend(
        &self,
        cx: &Cx,
        mgr: &TxnManager,
        txn: Option<&Transaction>,
        key: &[u8],
    ) -> Result<Node> {
        let mut node = self.load(cx, mgr, txn, self.root)?;
        while !node.is_leaf {
            let child = node.child_for(key)?;
            node = self.load(cx, mgr, txn, child)?;
        }
        Ok(node)
    }

    /// Descend to the leaf for `key`, recording the internal path for
    /// split propagation.
    fn descend_with_path(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
        key: &[u8],
    ) -> Result<(Node, Vec<PageId>)> {
        let mgr = match txn {
            Some(txn) => std::sync::Arc::clone(txn.manager()),
            None => return Err(BliteError::internal("mutation without a transaction")),
        };
        let mut path = Vec::new();
        let mut node = self.load(cx, &mgr, txn, self.root)?;
        while !node.is_leaf {
            path.push(node.page_id);
            let child = node.child_for(key)?;
            node = self.load(cx, &mgr, txn, child)?;
        }
        Ok((node, path))
    }

    fn leftmost_leaf(
        &self,
        cx: &Cx,
        mgr: &TxnManager,
        txn: Option<&Transaction>,
    ) -> Result<Node> {
        let mut node = self.load(cx, mgr, txn, self.root)?;
        while !node.is_leaf {
            node = self.load(cx, mgr, txn, node.leftmost_child())?;
        }
        Ok(node)
    }

    // -----------------------------------------------------------------------
    // Splits
    // -----------------------------------------------------------------------

    /// Split `node` and propagate separators upward along `path` until a
    /// parent absorbs the new entry or the root itself splits.
    fn split_upward(
        &self,
        cx: &Cx,
        txn: &mut Transaction,
        mut node: Node,
        mut path: Vec<PageId>,
    ) -> Result<()> {
        let mgr = std::sync::Arc::clone(txn.manager());
        loop {
            if node.page_id == self.root {
                return self.split_root(cx, txn, node);
            }
            let parent_id = path
                .pop()
                .ok_or_else(|| BliteError::internal("split path exhausted below root"))?;
            let right_id = mgr.page_file().allocate_page(cx, PageType::Index)?;
            let mid = node.entries.len() / 2;

            let (separator, right) = if node.is_leaf {
                let right_entries = node.entries.split_off(mid);
                let separator = right_entries[0].0.clone();
                let mut right = Node::new_leaf(right_id);
                right.entries = right_entries;
                right.parent = parent_id;
                right.prev_leaf = node.page_id;
                right.next_leaf = node.next_leaf;
                if node.next_leaf != NO_PAGE {
                    let mut next = self.load(cx, &mgr, Some(txn), node.next_leaf)?;
                    next.prev_leaf = right_id;
                    self.store(txn, &next)?;
                }
                node.next_leaf = right_id;
                (separator, right)
            } else {
                // Internal split moves the median up instead of copying it.
                let mut right_entries = node.entries.split_off(mid);
                let (separator, right_leftmost) = {
                    let (key, payload) = right_entries.remove(0);
                    (key, payload.child()?)
                };
                let mut right = Node::new_internal(right_id, right_leftmost);
                right.entries = right_entries;
                right.parent = parent_id;
                self.reparent_children(cx, txn, &right)?;
                (separator, right)
            };

            debug!(
                index = %self.name,
                left = node.page_id,
                right = right_id,
                "node split"
            );
            self.store(txn, &node)?;
            self.store(txn, &right)?;

            let mut parent = self.load(cx, &mgr, Some(txn), parent_id)?;
            let pos = parent.lower_bound(&separator);
            parent
                .entries
                .insert(pos, (separator, NodePayload::Child(right_id)));
            if parent.fits(self.page_size) {
                return self.store(txn, &parent);
            }
            node = parent;
        }
    }

    /// Split the root in place: both halves move to fresh pages and the
    /// root page becomes (or stays) an internal node.
    fn split_root(&self, cx: &Cx, txn: &mut Transaction, mut root: Node) -> Result<()> {
        let mgr = std::sync::Arc::clone(txn.manager());
        let left_id = mgr.page_file().allocate_page(cx, PageType::Index)?;
        let right_id = mgr.page_file().allocate_page(cx, PageType::Index)?;
        let mid = root.entries.len() / 2;

        if root.is_leaf {
            let right_entries = root.entries.split_off(mid);
            let left_entries = std::mem::take(&mut root.entries);
            let separator = right_entries[0].0.clone();

            let mut left = Node::new_leaf(left_id);
            left.entries = left_entries;
            left.parent = root.page_id;
            left.next_leaf = right_id;

            let mut right = Node::new_leaf(right_id);
            right.entries = right_entries;
            right.parent = root.page_id;
            right.prev_leaf = left_id;

            root.is_leaf = false;
            root.set_leftmost_child(left_id);
            root.prev_leaf = NO_PAGE;
            root.entries = vec![(separator, NodePayload::Child(right_id))];

            self.store(txn, &left)?;
            self.store(txn, &right)?;
        } else {
            let mut right_entries = root.entries.split_off(mid);
            let (separator, right_leftmost) = {
                let (key, payload) = right_entries.remove(0);
                (key, payload.child()?)
            };
            let left_entries = std::mem::take(&mut root.entries);

            let mut left = Node::new_internal(left_id, root.leftmost_child());
            left.entries = left_entries;
            left.parent = root.page_id;

            let mut right = Node::new_internal(right_id, right_leftmost);
            right.entries = right_entries;
            right.parent = root.page_id;

            self.reparent_children(cx, txn, &left)?;
            self.reparent_children(cx, txn, &right)?;

            root.set_leftmost_child(left_id);
            root.entries = vec![(separator, NodePayload::Child(right_id))];

            self.store(txn, &left)?;
            self.store(txn, &right)?;
        }

        debug!(index = %self.name, root = root.page_id, "root split");
        self.store(txn, &root)
    }

    /// Point every child of `node` back at it after entries moved.
    fn reparent_children(&self, cx: &Cx, txn: &mut Transaction, node: &Node) -> Result<()> {
        let mgr = std::sync::Arc::clone(txn.manager());
        let mut children = vec![node.leftmost_child()];
        for (_, payload) in &node.entries {
            children.push(payload.child()?);
        }
        for child_id in children {
            let mut child = self.load(cx, &mgr, Some(txn), child_id)?;
            if child.parent != node.page_id {
                child.parent = node.page_id;
                self.store(txn, &child)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum UpperBound {
    Unbounded,
    Inclusive(Vec<u8>),
    Prefix(Vec<u8>),
}

impl UpperBound {
    fn admits(&self, key: &[u8]) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Inclusive(max) => key <= max.as_slice(),
            Self::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

/// Ordered walk over leaf entries via sibling links.
pub struct EntryIter<'a> {
    mgr: &'a TxnManager,
    txn: Option<&'a Transaction>,
    cx: Cx,
    node: Option<Node>,
    pos: usize,
    upper: UpperBound,
}

impl Iterator for EntryIter<'_> {
    type Item = Result<(Vec<u8>, DocumentLocation)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.pos >= node.entries.len() {
                let next_id = node.next_leaf;
                if next_id == NO_PAGE {
                    self.node = None;
                    return None;
                }
                match self
                    .mgr
                    .read_page(&self.cx, self.txn, next_id)
                    .and_then(|buf| Node::decode(&buf))
                {
                    Ok(next) => {
                        self.node = Some(next);
                        self.pos = 0;
                        continue;
                    }
                    Err(err) => {
                        self.node = None;
                        return Some(Err(err));
                    }
                }
            }

            let (key, payload) = &node.entries[self.pos];
            if !self.upper.admits(key) {
                self.node = None;
                return None;
            }
            self.pos += 1;
            let loc = match payload.location() {
                Ok(loc) => loc,
                Err(err) => {
                    self.node = None;
                    return Some(Err(err));
                }
            };
            return Some(Ok((key.clone(), loc)));
        }
    }
}
