//! Database configuration knobs and their defaults.

use std::time::Duration;

use blite_error::{BliteError, Result};

/// Page sizes the on-disk format supports.
pub const SUPPORTED_PAGE_SIZES: [usize; 3] = [8192, 16384, 32768];

/// Tunables accepted at database open. `Default` carries the documented
/// default for every knob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Physical page unit. One of 8192, 16384, 32768.
    pub page_size: usize,
    /// Minimum file-growth increment; bounds allocation waste by one block.
    pub grow_block_bytes: usize,
    /// WAL size at which the passive checkpoint fires.
    pub wal_auto_checkpoint_bytes: u64,
    /// Periodic checkpoint trigger.
    pub wal_auto_checkpoint_interval: Duration,
    /// Upper bound on the in-memory parsed-page cache, in pages.
    pub cache_pages: usize,
    /// Hard ceiling on a single encoded document.
    pub max_document_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: 16384,
            grow_block_bytes: 1024 * 1024,
            wal_auto_checkpoint_bytes: 10 * 1024 * 1024,
            wal_auto_checkpoint_interval: Duration::from_secs(30),
            cache_pages: 1024,
            max_document_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Options {
    /// Reject combinations the on-disk format cannot represent.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_PAGE_SIZES.contains(&self.page_size) {
            return Err(BliteError::invalid_format(format!(
                "unsupported page size {}",
                self.page_size
            )));
        }
        if self.grow_block_bytes < self.page_size {
            return Err(BliteError::invalid_format(
                "grow block must be at least one page",
            ));
        }
        if self.grow_block_bytes % self.page_size != 0 {
            return Err(BliteError::invalid_format(
                "grow block must be a whole number of pages",
            ));
        }
        if self.cache_pages == 0 {
            return Err(BliteError::invalid_format("cache must hold at least one page"));
        }
        Ok(())
    }

    /// Override the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Override the growth block.
    #[must_use]
    pub fn with_grow_block_bytes(mut self, bytes: usize) -> Self {
        self.grow_block_bytes = bytes;
        self
    }

    /// Override the WAL size checkpoint trigger.
    #[must_use]
    pub fn with_wal_auto_checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.wal_auto_checkpoint_bytes = bytes;
        self
    }

    /// Override the periodic checkpoint trigger.
    #[must_use]
    pub fn with_wal_auto_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.wal_auto_checkpoint_interval = interval;
        self
    }

    /// Override the parsed-page cache bound.
    #[must_use]
    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Override the document size ceiling.
    #[must_use]
    pub fn with_max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = bytes;
        self
    }
}
