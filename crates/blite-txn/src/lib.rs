//! Transaction manager: begin/prepare/commit/rollback with write-set
//! buffering and read-your-own-writes.
//!
//! Reads route through three layers: the transaction's own write-set,
//! then the manager's overlay of pages committed to the WAL but not yet
//! checkpointed, then the page file. A process-wide commit lock serializes
//! TxnId allocation and WAL commit ordering; reads never take it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use blite_bson::BsonValue;
use blite_error::{BliteError, Result};
use blite_pager::PageFile;
use blite_types::{Cx, DocumentLocation, PageId, TxnId};
use blite_wal::Wal;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Isolation levels a caller may request. The engine guarantees
/// ReadCommitted with read-your-own-writes; stronger levels degrade to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Snapshot,
    Serializable,
}

/// Lifecycle of a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

/// What a buffered document operation did, for post-commit fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A document-level change recorded alongside the page writes, published
/// to subscribers only after the Commit record is durable.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// Collection the document belongs to.
    pub collection: String,
    pub op: ChangeOp,
    /// The document's id value.
    pub doc_id: BsonValue,
    /// Encoded document bytes after the change; `None` for deletes.
    pub after: Option<Arc<Vec<u8>>>,
    /// Physical location after the change.
    pub location: DocumentLocation,
}

/// What a successful commit hands back to the caller: the change events
/// to fan out and the pages whose reclamation was deferred until the
/// transaction became durable.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub changes: Vec<PendingChange>,
    pub freed_pages: Vec<PageId>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Process-wide transaction coordinator. One per open database.
#[derive(Debug)]
pub struct TxnManager {
    wal: Arc<Wal>,
    page_file: Arc<PageFile>,
    /// Next TxnId; monotonically assigned from 1 at process start.
    next_txn_id: AtomicU64,
    /// Serializes begin (id allocation), Write emission, and commit
    /// (WAL ordering).
    commit_lock: Mutex<()>,
    /// Transactions whose Write records are in the log without a Commit
    /// yet. Truncating checkpoints stand down while this is non-zero.
    preparing: AtomicUsize,
    /// Latest committed after-image per page, until a checkpoint applies
    /// it to the page file.
    overlay: RwLock<HashMap<PageId, Arc<Vec<u8>>>>,
}

impl TxnManager {
    /// Build the coordinator over an open page file and its WAL.
    #[must_use]
    pub fn new(page_file: Arc<PageFile>, wal: Arc<Wal>) -> Arc<Self> {
        Arc::new(Self {
            wal,
            page_file,
            next_txn_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            preparing: AtomicUsize::new(0),
            overlay: RwLock::new(HashMap::new()),
        })
    }

    /// The page file this manager coordinates.
    #[must_use]
    pub fn page_file(&self) -> &Arc<PageFile> {
        &self.page_file
    }

    /// The write-ahead log.
    #[must_use]
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Begin a transaction: allocate a TxnId and emit its Begin record.
    pub fn begin(self: &Arc<Self>, cx: &Cx, isolation: IsolationLevel) -> Result<Transaction> {
        cx.checkpoint()?;
        let _serialize = self.commit_lock.lock();
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        self.wal.append_begin(cx, id)?;
        debug!(txn_id = id, ?isolation, "transaction started");
        Ok(Transaction {
            id,
            state: TxnState::Active,
            write_set: HashMap::new(),
            write_order: Vec::new(),
            changes: Vec::new(),
            deferred_frees: Vec::new(),
            prepare_marked: false,
            mgr: Arc::clone(self),
        })
    }

    /// Read a page through the routing stack: the transaction write-set
    /// (when one is supplied), the committed overlay, then the page file.
    pub fn read_page(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
        page_id: PageId,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(txn) = txn
            && let Some(buffered) = txn.get_buffered_page(page_id)
        {
            return Ok(buffered);
        }
        if let Some(committed) = self.overlay.read().get(&page_id) {
            return Ok(Arc::clone(committed));
        }
        self.page_file.read(cx, page_id)
    }

    /// Hold the commit lock. The checkpoint manager takes this while
    /// measuring the WAL length and while truncating.
    #[must_use]
    pub fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Transactions currently between prepare and commit. While non-zero
    /// the log holds Write records whose Commit has not landed, so it
    /// must not be truncated.
    #[must_use]
    pub fn preparing_count(&self) -> usize {
        self.preparing.load(Ordering::Acquire)
    }

    /// Number of pages in the committed-but-not-checkpointed overlay.
    #[must_use]
    pub fn overlay_len(&self) -> usize {
        self.overlay.read().len()
    }

    /// Drop the overlay after a checkpoint made the page file current.
    pub fn clear_overlay(&self) {
        self.overlay.write().clear();
    }

    fn install_overlay(&self, write_set: &HashMap<PageId, Arc<Vec<u8>>>) {
        let mut overlay = self.overlay.write();
        for (page_id, image) in write_set {
            overlay.insert(*page_id, Arc::clone(image));
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A single transaction. Dropping a non-terminal transaction rolls back.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TxnState,
    /// At most one buffered after-image per page; last writer wins.
    write_set: HashMap<PageId, Arc<Vec<u8>>>,
    /// First-write order, so WAL emission is deterministic.
    write_order: Vec<PageId>,
    changes: Vec<PendingChange>,
    /// Pages to return to the free-list once the commit is durable.
    deferred_frees: Vec<PageId>,
    /// Whether this transaction holds a slot in the manager's preparing
    /// count (set by prepare, released by commit or abort).
    prepare_marked: bool,
    mgr: Arc<TxnManager>,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The manager this transaction belongs to.
    #[must_use]
    pub fn manager(&self) -> &Arc<TxnManager> {
        &self.mgr
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Number of distinct pages buffered.
    #[must_use]
    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    /// Buffer a page after-image. The image is copied, so the caller may
    /// recycle its buffer immediately. Writes to the same page coalesce.
    pub fn add_write(&mut self, page_id: PageId, after_image: &[u8]) -> Result<()> {
        self.require_active()?;
        if self.write_set.insert(page_id, Arc::new(after_image.to_vec())).is_none() {
            self.write_order.push(page_id);
        }
        Ok(())
    }

    /// Record a document-level change for post-commit fan-out.
    pub fn add_change(&mut self, change: PendingChange) -> Result<()> {
        self.require_active()?;
        self.changes.push(change);
        Ok(())
    }

    /// Schedule a page to be freed after the commit is durable. Freeing
    /// eagerly would corrupt the chain if the transaction aborted.
    pub fn defer_free(&mut self, page_id: PageId) -> Result<()> {
        self.require_active()?;
        self.deferred_frees.push(page_id);
        Ok(())
    }

    /// Read-your-own-writes lookup in the write-set.
    #[must_use]
    pub fn get_buffered_page(&self, page_id: PageId) -> Option<Arc<Vec<u8>>> {
        self.write_set.get(&page_id).map(Arc::clone)
    }

    /// Read a page as this transaction sees it.
    pub fn read_page(&self, cx: &Cx, page_id: PageId) -> Result<Arc<Vec<u8>>> {
        self.mgr.read_page(cx, Some(self), page_id)
    }

    /// Emit every buffered Write record and flush the WAL.
    ///
    /// Transitions Active → Preparing. Emission happens under the commit
    /// lock so a truncating checkpoint can never interleave with it. Any
    /// I/O failure aborts the transaction and propagates the original
    /// error.
    pub fn prepare(&mut self, cx: &Cx) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(BliteError::conflict(format!(
                "prepare from {:?}",
                self.state
            )));
        }
        self.state = TxnState::Preparing;

        let result = {
            let _ordering = self.mgr.commit_lock.lock();
            self.mgr.preparing.fetch_add(1, Ordering::AcqRel);
            self.prepare_marked = true;
            self.emit_writes(cx)
        };

        if let Err(err) = result {
            error!(txn_id = self.id, %err, "prepare failed; aborting");
            self.abort_after_failure(cx);
            return Err(err);
        }
        Ok(())
    }

    fn emit_writes(&self, cx: &Cx) -> Result<()> {
        for page_id in &self.write_order {
            let image = self
                .write_set
                .get(page_id)
                .ok_or_else(|| BliteError::internal("write-set entry vanished"))?;
            self.mgr.wal.append_write(cx, self.id, *page_id, image)?;
        }
        self.mgr.wal.sync(cx)
    }

    /// Emit the Commit record, flush, and publish the write-set to late
    /// readers. Must be called in Preparing state.
    ///
    /// Returns the document-level changes for the dispatcher and the
    /// deferred page frees; both are only handed out once the Commit
    /// record is durable.
    pub fn commit(&mut self, cx: &Cx) -> Result<CommitOutcome> {
        if self.state != TxnState::Preparing {
            return Err(BliteError::conflict(format!(
                "commit from {:?}",
                self.state
            )));
        }

        let result = {
            let _ordering = self.mgr.commit_lock.lock();
            let appended = self
                .mgr
                .wal
                .append_commit(cx, self.id)
                .and_then(|()| self.mgr.wal.sync(cx));
            if appended.is_ok() && self.prepare_marked {
                self.mgr.preparing.fetch_sub(1, Ordering::AcqRel);
                self.prepare_marked = false;
            }
            appended
        };

        if let Err(err) = result {
            error!(txn_id = self.id, %err, "commit failed; aborting");
            self.abort_after_failure(cx);
            return Err(err);
        }

        // The commit record is durable; the write-set becomes visible to
        // every reader until the next checkpoint folds it into the file.
        self.mgr.install_overlay(&self.write_set);
        self.state = TxnState::Committed;
        self.write_set.clear();
        self.write_order.clear();
        debug!(txn_id = self.id, "transaction committed");
        Ok(CommitOutcome {
            changes: std::mem::take(&mut self.changes),
            freed_pages: std::mem::take(&mut self.deferred_frees),
        })
    }

    /// Discard the write-set and emit an Abort record. Idempotent after
    /// the first call; a committed transaction cannot be rolled back.
    pub fn rollback(&mut self, cx: &Cx) -> Result<()> {
        match self.state {
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(BliteError::conflict("rollback after commit")),
            TxnState::Active | TxnState::Preparing => {
                self.discard();
                // Best-effort marker; the write-set is already gone, so a
                // failed append only costs log hygiene.
                let _ = self.mgr.wal.append_abort(cx, self.id);
                self.state = TxnState::Aborted;
                debug!(txn_id = self.id, "transaction rolled back");
                Ok(())
            }
        }
    }

    fn abort_after_failure(&mut self, cx: &Cx) {
        self.discard();
        let _ = self.mgr.wal.append_abort(cx, self.id);
        self.state = TxnState::Aborted;
    }

    fn discard(&mut self) {
        self.write_set.clear();
        self.write_order.clear();
        self.changes.clear();
        self.deferred_frees.clear();
        self.release_prepare_mark();
    }

    fn release_prepare_mark(&mut self) {
        if self.prepare_marked {
            self.mgr.preparing.fetch_sub(1, Ordering::AcqRel);
            self.prepare_marked = false;
        }
    }

    fn require_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(BliteError::conflict(format!(
                "write in {:?} state",
                self.state
            )));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Active | TxnState::Preparing) {
            let _ = self.rollback(&Cx::new());
        }
    }
}
