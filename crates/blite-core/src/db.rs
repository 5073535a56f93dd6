//! The `Database` facade: open/recover, the collection registry, commit
//! plumbing (free-list reclamation, change fan-out, dictionary
//! durability), the background checkpointer, and shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use blite_btree::BTree;
use blite_error::{BliteError, Result};
use blite_pager::PageFile;
use blite_txn::{IsolationLevel, Transaction, TxnManager};
use blite_types::{CATALOG_PAGE_ID, Cx, Options, PageType};
use blite_wal::Wal;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::catalog::{Catalog, CollectionMeta, KeyType};
use crate::checkpoint::{CheckpointManager, CheckpointMode, CheckpointStats, Checkpointer};
use crate::collection::Collection;
use crate::dictionary::Dictionary;
use crate::mapper::{BsonMapper, DocumentMapper};
use crate::watch::{ChangeDispatcher, Subscription};

/// Shared engine state behind every handle.
pub(crate) struct CoreState {
    pub(crate) options: Options,
    pub(crate) page_file: Arc<PageFile>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) txn_mgr: Arc<TxnManager>,
    pub(crate) dictionary: Dictionary,
    pub(crate) catalog: Catalog,
    pub(crate) dispatcher: ChangeDispatcher,
    pub(crate) checkpoint: Arc<CheckpointManager>,
}

impl CoreState {
    /// Prepare + commit, then run the post-durability work: dictionary
    /// promotion, deferred page frees, and change fan-out.
    pub(crate) fn commit(&self, cx: &Cx, mut txn: Transaction) -> Result<()> {
        let txn_id = txn.id();
        if let Err(err) = txn.prepare(cx) {
            self.dictionary.on_abort(txn_id);
            return Err(err);
        }
        let outcome = match txn.commit(cx) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.dictionary.on_abort(txn_id);
                return Err(err);
            }
        };
        self.dictionary.on_commit(txn_id);
        if !outcome.freed_pages.is_empty() {
            // Drain and reset the log before stamping pages Free: a later
            // replay of older committed images must not resurrect a freed
            // page. Truncation can be deferred by in-flight prepares, so
            // reclamation only proceeds once a reset actually happened.
            let mut truncated = false;
            for _ in 0..3 {
                if self.checkpoint.run(cx, CheckpointMode::Truncate)?.truncated {
                    truncated = true;
                    break;
                }
            }
            if truncated {
                for page_id in &outcome.freed_pages {
                    // Reclamation is advisory after the commit point; a
                    // failure only leaks the page until the next pass.
                    if let Err(err) = self.page_file.free_page(cx, *page_id) {
                        warn!(page_id, %err, "deferred page free failed");
                    }
                }
            } else {
                warn!(
                    pages = outcome.freed_pages.len(),
                    "page reclamation skipped; log kept records from preparing transactions"
                );
            }
        }
        self.dispatcher.dispatch(&outcome.changes);
        Ok(())
    }

    /// Roll back and drop the dictionary note for the transaction.
    pub(crate) fn rollback(&self, cx: &Cx, mut txn: Transaction) {
        self.dictionary.on_abort(txn.id());
        if let Err(err) = txn.rollback(cx) {
            warn!(txn_id = txn.id(), %err, "rollback failed");
        }
    }
}

/// An open BLite database: one file, one process, exclusive lock.
pub struct Database {
    core: Arc<CoreState>,
    checkpoint: Arc<CheckpointManager>,
    checkpointer: Mutex<Option<Checkpointer>>,
    closed: AtomicBool,
}

impl Database {
    /// Create or open the database at `path` and recover from the WAL.
    pub fn open(cx: &Cx, path: &Path, options: Options) -> Result<Self> {
        options.validate()?;
        let page_file = Arc::new(PageFile::create(cx, path, &options)?);
        let wal = Arc::new(Wal::new(&wal_path(path)));
        let txn_mgr = TxnManager::new(Arc::clone(&page_file), Arc::clone(&wal));
        let checkpoint = Arc::new(CheckpointManager::new(
            Arc::clone(&page_file),
            Arc::clone(&wal),
            Arc::clone(&txn_mgr),
        ));

        // Crash recovery: replay committed WAL records, then truncate.
        // An empty log means the file is already consistent.
        if !wal.is_empty() {
            let stats = checkpoint.run(cx, CheckpointMode::Truncate)?;
            info!(
                transactions = stats.transactions_applied,
                pages = stats.pages_applied,
                "recovered from write-ahead log"
            );
        }

        let dictionary = Dictionary::load(cx, &page_file)?;
        let catalog = Catalog::load(&page_file.read(cx, CATALOG_PAGE_ID)?)?;
        let core = Arc::new(CoreState {
            options: options.clone(),
            page_file,
            wal,
            txn_mgr,
            dictionary,
            catalog,
            dispatcher: ChangeDispatcher::new(),
            checkpoint: Arc::clone(&checkpoint),
        });

        let checkpointer = Checkpointer::spawn(Arc::clone(&checkpoint), &options);
        info!(path = %path.display(), "database open");
        Ok(Self {
            core,
            checkpoint,
            checkpointer: Mutex::new(Some(checkpointer)),
            closed: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Create a collection. Fails `Exists` when the name is taken.
    pub fn create_collection(&self, cx: &Cx, name: &str, key_type: KeyType) -> Result<Collection> {
        if self.core.catalog.get(name).is_some() {
            return Err(BliteError::Exists {
                name: name.to_owned(),
            });
        }

        let page_size = self.core.page_file.page_size();
        let mut txn = self.begin(cx, IsolationLevel::ReadCommitted)?;
        let result = (|| -> Result<u32> {
            let primary_root = BTree::create_root(cx, &mut txn)?;
            let meta_page = self.core.page_file.allocate_page(cx, PageType::Schema)?;
            let meta = CollectionMeta::new(name, key_type, primary_root);
            txn.add_write(meta_page, &meta.encode_page(meta_page, page_size)?)?;
            txn.add_write(
                CATALOG_PAGE_ID,
                &self.core.catalog.encode_with(name, meta_page, page_size)?,
            )?;
            Ok(meta_page)
        })();

        match result {
            Ok(meta_page) => {
                self.core.commit(cx, txn)?;
                self.core.catalog.apply_insert(name, meta_page);
                info!(collection = name, "collection created");
                Ok(self.handle(name, meta_page))
            }
            Err(err) => {
                self.core.rollback(cx, txn);
                Err(err)
            }
        }
    }

    /// Handle to an existing collection.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let meta_page = self
            .core
            .catalog
            .get(name)
            .ok_or_else(|| BliteError::not_found(format!("collection {name}")))?;
        Ok(self.handle(name, meta_page))
    }

    /// Sorted names of every collection.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.core.catalog.names()
    }

    /// Drop a collection: catalog entry, metadata, data and overflow
    /// chains, and every index page go back to the free-list.
    pub fn drop_collection(&self, cx: &Cx, name: &str) -> Result<()> {
        let meta_page = self
            .core
            .catalog
            .get(name)
            .ok_or_else(|| BliteError::not_found(format!("collection {name}")))?;
        let handle = self.handle(name, meta_page);
        let page_size = self.core.page_file.page_size();

        let mut txn = self.begin(cx, IsolationLevel::ReadCommitted)?;
        let result = (|| -> Result<()> {
            let meta = handle.load_meta(cx, Some(&txn))?;
            txn.defer_free(meta_page)?;
            for page_id in handle.collect_tree_pages(cx, Some(&txn), meta.primary_root)? {
                txn.defer_free(page_id)?;
            }
            for index in &meta.indexes {
                for page_id in handle.collect_tree_pages(cx, Some(&txn), index.root)? {
                    txn.defer_free(page_id)?;
                }
            }
            for page_id in handle.collect_data_pages(cx, Some(&txn), &meta)? {
                txn.defer_free(page_id)?;
            }
            txn.add_write(
                CATALOG_PAGE_ID,
                &self.core.catalog.encode_without(name, page_size)?,
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.core.commit(cx, txn)?;
                self.core.catalog.apply_remove(name);
                info!(collection = name, "collection dropped");
                Ok(())
            }
            Err(err) => {
                self.core.rollback(cx, txn);
                Err(err)
            }
        }
    }

    fn handle(&self, name: &str, meta_page: u32) -> Collection {
        Collection::open(
            Arc::clone(&self.core),
            name.to_owned(),
            meta_page,
            Arc::new(BsonMapper) as Arc<dyn DocumentMapper>,
        )
    }

    /// Handle with a caller-supplied mapper instead of the default.
    pub fn collection_with_mapper(
        &self,
        name: &str,
        mapper: Arc<dyn DocumentMapper>,
    ) -> Result<Collection> {
        let meta_page = self
            .core
            .catalog
            .get(name)
            .ok_or_else(|| BliteError::not_found(format!("collection {name}")))?;
        Ok(Collection::open(
            Arc::clone(&self.core),
            name.to_owned(),
            meta_page,
            mapper,
        ))
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Begin an explicit transaction.
    pub fn begin(&self, cx: &Cx, isolation: IsolationLevel) -> Result<Transaction> {
        self.core.txn_mgr.begin(cx, isolation)
    }

    /// Commit an explicit transaction, publishing its changes and
    /// reclaiming its deferred pages.
    pub fn commit(&self, cx: &Cx, txn: Transaction) -> Result<()> {
        self.core.commit(cx, txn)
    }

    /// Roll back an explicit transaction.
    pub fn rollback(&self, cx: &Cx, txn: Transaction) {
        self.core.rollback(cx, txn);
    }

    // -----------------------------------------------------------------------
    // Observation and maintenance
    // -----------------------------------------------------------------------

    /// Subscribe to a collection's change feed.
    #[must_use]
    pub fn subscribe(&self, collection: &str) -> Subscription {
        self.core.dispatcher.subscribe(collection)
    }

    /// Run a checkpoint pass now.
    pub fn checkpoint(&self, cx: &Cx, mode: CheckpointMode) -> Result<CheckpointStats> {
        self.checkpoint.run(cx, mode)
    }

    /// Current WAL length in bytes.
    #[must_use]
    pub fn wal_len(&self) -> u64 {
        self.core.wal.len()
    }

    /// Stop the background checkpointer, fold the WAL into the data file,
    /// and release the lock. Also runs from `Drop`.
    pub fn close(&self, cx: &Cx) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut checkpointer) = self.checkpointer.lock().take() {
            checkpointer.shutdown();
        }
        self.checkpoint.run(cx, CheckpointMode::Truncate)?;
        info!("database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close(&Cx::new()) {
            warn!(%err, "close on drop failed");
        }
    }
}

/// The WAL sidecar lives next to the database file: `<db>.wal`.
fn wal_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_path_appends_suffix() {
        assert_eq!(
            wal_path(Path::new("/tmp/a.db")),
            PathBuf::from("/tmp/a.db.wal")
        );
    }
}
