//! Lazy checkpointing: fold committed WAL records into the page file and
//! (in the truncating modes) reset the log.
//!
//! A pass applies the bulk of the log without blocking committers, then
//! takes the commit lock for the final delta so truncation can never lose
//! a record. Replay order is WAL order; overwrites are safe because every
//! Write record carries the complete after-image.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use blite_error::Result;
use blite_pager::PageFile;
use blite_txn::TxnManager;
use blite_types::{Cx, Options, TxnId};
use blite_wal::{Wal, WalRecord};
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

/// How much work a checkpoint pass does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Best effort: apply committed records, keep the log.
    Passive,
    /// Passive plus an explicit final data-file sync.
    Full,
    /// Full plus WAL truncation.
    Truncate,
    /// Truncate plus reset of the in-memory position counters.
    Restart,
}

impl CheckpointMode {
    fn truncates(self) -> bool {
        matches!(self, Self::Truncate | Self::Restart)
    }
}

/// Outcome of one checkpoint pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Committed transactions replayed.
    pub transactions_applied: usize,
    /// Page images written to the data file.
    pub pages_applied: usize,
    /// Log bytes covered by this pass.
    pub wal_bytes: u64,
    /// Whether the pass actually reset the log (truncating modes only;
    /// deferred when transactions were mid-prepare).
    pub truncated: bool,
}

/// Applies the WAL to the page file on demand or from the background task.
#[derive(Debug)]
pub struct CheckpointManager {
    page_file: Arc<PageFile>,
    wal: Arc<Wal>,
    txn_mgr: Arc<TxnManager>,
    /// Log position already folded into the page file.
    last_checkpoint_pos: AtomicU64,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(page_file: Arc<PageFile>, wal: Arc<Wal>, txn_mgr: Arc<TxnManager>) -> Self {
        Self {
            page_file,
            wal,
            txn_mgr,
            last_checkpoint_pos: AtomicU64::new(0),
        }
    }

    /// Log bytes accumulated since the last pass.
    #[must_use]
    pub fn wal_delta(&self) -> u64 {
        self.wal
            .len()
            .saturating_sub(self.last_checkpoint_pos.load(Ordering::Acquire))
    }

    /// Run one checkpoint pass.
    pub fn run(&self, cx: &Cx, mode: CheckpointMode) -> Result<CheckpointStats> {
        cx.checkpoint()?;
        let mut stats = CheckpointStats::default();

        // Bulk phase: apply everything currently in the log without
        // holding the commit lock.
        let bulk_len = {
            let _measure = self.txn_mgr.lock_commits();
            self.wal.len()
        };
        if bulk_len > 0 {
            self.apply_range(cx, bulk_len, &mut stats)?;
        }

        // Delta phase under the commit lock: catch records committed
        // during the bulk phase, then truncate with nothing in flight.
        // A transaction that has prepared but not committed still owns
        // Write records in the log, so truncation stands down until the
        // next pass.
        {
            let _ordering = self.txn_mgr.lock_commits();
            let final_len = self.wal.len();
            if final_len > bulk_len {
                self.apply_range(cx, final_len, &mut stats)?;
            }
            stats.wal_bytes = final_len;

            if mode.truncates() && self.txn_mgr.preparing_count() == 0 {
                self.wal.truncate(cx)?;
                stats.truncated = true;
                self.txn_mgr.clear_overlay();
                self.last_checkpoint_pos.store(0, Ordering::Release);
            } else {
                if mode.truncates() {
                    debug!("truncation deferred; transactions are preparing");
                }
                self.txn_mgr.clear_overlay();
                self.last_checkpoint_pos.store(final_len, Ordering::Release);
            }
        }

        if matches!(mode, CheckpointMode::Restart) {
            self.page_file.invalidate_cache();
        }
        if matches!(mode, CheckpointMode::Full | CheckpointMode::Truncate | CheckpointMode::Restart) {
            self.page_file.flush(cx)?;
        }

        info!(
            ?mode,
            transactions = stats.transactions_applied,
            pages = stats.pages_applied,
            wal_bytes = stats.wal_bytes,
            "checkpoint pass complete"
        );
        Ok(stats)
    }

    /// Apply the committed prefix of the log up to `limit` and fsync.
    fn apply_range(&self, cx: &Cx, limit: u64, stats: &mut CheckpointStats) -> Result<()> {
        let records = self.wal.read_up_to(cx, limit)?;
        let committed: HashSet<TxnId> = records
            .iter()
            .filter_map(|record| match record {
                WalRecord::Commit { txn_id, .. } => Some(*txn_id),
                _ => None,
            })
            .collect();

        let mut pages = 0_usize;
        for record in records {
            if let WalRecord::Write {
                txn_id,
                page_id,
                mut after,
            } = record
                && committed.contains(&txn_id)
            {
                self.page_file.ensure_allocated(cx, page_id)?;
                self.page_file.write(cx, page_id, &mut after)?;
                pages += 1;
            }
        }
        if pages > 0 {
            self.page_file.flush(cx)?;
        }
        stats.transactions_applied += committed.len();
        stats.pages_applied += pages;
        debug!(limit, pages, transactions = committed.len(), "applied WAL range");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

struct CheckpointSignal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Owns the background checkpoint thread. Two triggers: the WAL growing
/// past `wal_auto_checkpoint_bytes`, or `wal_auto_checkpoint_interval`
/// elapsing.
pub struct Checkpointer {
    signal: Arc<CheckpointSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Spawn the background task.
    #[must_use]
    pub fn spawn(manager: Arc<CheckpointManager>, options: &Options) -> Self {
        let signal = Arc::new(CheckpointSignal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let interval = options.wal_auto_checkpoint_interval;
        let threshold = options.wal_auto_checkpoint_bytes;

        let handle = std::thread::Builder::new()
            .name("blite-checkpoint".to_owned())
            .spawn(move || run_loop(&manager, &thread_signal, interval, threshold))
            .expect("spawn checkpoint thread");
        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for it to exit.
    pub fn shutdown(&mut self) {
        {
            let mut stop = self.signal.stop.lock();
            *stop = true;
            self.signal.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    manager: &CheckpointManager,
    signal: &CheckpointSignal,
    interval: Duration,
    threshold: u64,
) {
    let cx = Cx::new();
    loop {
        {
            let mut stop = signal.stop.lock();
            if *stop {
                return;
            }
            signal.wake.wait_for(&mut stop, interval);
            if *stop {
                return;
            }
        }

        let due_by_size = manager.wal_delta() >= threshold;
        let mode = if due_by_size {
            CheckpointMode::Truncate
        } else {
            CheckpointMode::Passive
        };
        if let Err(err) = manager.run(&cx, mode) {
            warn!(%err, "background checkpoint failed");
        }
    }
}
