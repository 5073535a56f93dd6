//! Append-only journal of committed page after-images.
//!
//! The design is REDO-only: rollback discards the in-memory write-set and
//! never touches the log. Crash recovery replays only transactions whose
//! Commit record made it to stable storage; any malformed tail is treated
//! as the end of the log.

mod record;

pub use record::{RECORD_TYPE_RANGE, WalRecord};

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use blite_error::{BliteError, Result};
use blite_types::{Cx, PageId, TxnId};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Append state: the sidecar file is created lazily on first append.
#[derive(Debug)]
struct WalInner {
    writer: Option<BufWriter<File>>,
    /// Logical length: bytes appended (buffered or flushed).
    len: u64,
}

/// The write-ahead log, one per database, at `<db>.wal`.
///
/// Appends are serialized internally; there is at most one concurrent
/// writer by construction (the commit lock), the mutex makes it safe
/// regardless.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Handle to the sidecar at `path`. No I/O happens until first use;
    /// an existing file's length is picked up lazily as well.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        let len = std::fs::metadata(path).map_or(0, |meta| meta.len());
        Self {
            path: path.to_owned(),
            inner: Mutex::new(WalInner { writer: None, len }),
        }
    }

    /// Sidecar path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical log length in bytes (appended, not necessarily synced).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Appending
    // -----------------------------------------------------------------------

    /// Append a Begin record.
    pub fn append_begin(&self, cx: &Cx, txn_id: TxnId) -> Result<()> {
        self.append(cx, &WalRecord::begin(txn_id))
    }

    /// Append a full-page after-image.
    pub fn append_write(&self, cx: &Cx, txn_id: TxnId, page_id: PageId, after: &[u8]) -> Result<()> {
        self.append(
            cx,
            &WalRecord::Write {
                txn_id,
                page_id,
                after: after.to_vec(),
            },
        )
    }

    /// Append a Commit record. The caller follows with [`Wal::sync`].
    pub fn append_commit(&self, cx: &Cx, txn_id: TxnId) -> Result<()> {
        self.append(cx, &WalRecord::commit(txn_id))
    }

    /// Append an Abort record.
    pub fn append_abort(&self, cx: &Cx, txn_id: TxnId) -> Result<()> {
        self.append(cx, &WalRecord::abort(txn_id))
    }

    /// Append a Checkpoint marker.
    pub fn append_checkpoint(&self, cx: &Cx, txn_id: TxnId) -> Result<()> {
        self.append(cx, &WalRecord::checkpoint(txn_id))
    }

    fn append(&self, cx: &Cx, record: &WalRecord) -> Result<()> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock();
        let encoded = record.encode();
        if inner.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            inner.writer = Some(BufWriter::new(file));
        }
        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| BliteError::internal("WAL writer missing after open"))?;
        writer.write_all(&encoded)?;
        inner.len += encoded.len() as u64;
        Ok(())
    }

    /// Flush buffered appends and fsync to stable storage.
    pub fn sync(&self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Reset the log to zero bytes. Only called after a checkpoint has
    /// applied everything durable.
    pub fn truncate(&self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
            let file = writer.get_ref();
            file.set_len(0)?;
            file.sync_data()?;
        } else if self.path.exists() {
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(0)?;
            file.sync_data()?;
        }
        inner.len = 0;
        debug!("truncated write-ahead log");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Parse records from the start of the log up to `limit` bytes,
    /// stopping at the first malformed record. Buffered appends are
    /// flushed first so the read sees the logical length.
    pub fn read_up_to(&self, cx: &Cx, limit: u64) -> Result<Vec<WalRecord>> {
        cx.checkpoint()?;
        {
            let mut inner = self.inner.lock();
            if let Some(writer) = inner.writer.as_mut() {
                writer.flush()?;
            }
        }
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let limit = (limit.min(bytes.len() as u64)) as usize;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos < limit {
            match WalRecord::decode(&bytes[pos..limit]) {
                Some((record, consumed)) => {
                    pos += consumed;
                    records.push(record);
                }
                None => {
                    warn!(
                        offset = pos,
                        "malformed record tail; treating as end of log"
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Parse every record currently in the log.
    pub fn read_all(&self, cx: &Cx) -> Result<Vec<WalRecord>> {
        self.read_up_to(cx, u64::MAX)
    }
}
