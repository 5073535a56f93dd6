//! Block-aligned paged file with an exclusive advisory lock.
//!
//! Page 0 is the file header, page 1 the collection catalog. The free-list
//! is a singly linked chain of `Free` pages rooted at page 0's
//! `next_page_id` field. Growth happens in whole grow-blocks so waste is
//! bounded by one block.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blite_error::{BliteError, Result};
use blite_types::{
    CATALOG_PAGE_ID, Cx, HEADER_PAGE_ID, NO_PAGE, Options, PAGE_HEADER_SIZE, PageId, PageType,
};
use fs2::FileExt as _;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::PageCache;
use crate::header::{PageHeader, stamp_checksum, verify_checksum};

/// Magic string at the start of the file-header page body.
const MAGIC: &[u8] = b"** This is a BLite file **";
/// On-disk format version.
const FORMAT_VERSION: u8 = 1;

// File-header body offsets (relative to the page start).
const P_MAGIC: usize = PAGE_HEADER_SIZE;
const P_VERSION: usize = P_MAGIC + 26;
const P_PAGE_SIZE: usize = P_VERSION + 1;
const P_GROW_BLOCK: usize = P_PAGE_SIZE + 4;
const P_LAST_PAGE_ID: usize = P_GROW_BLOCK + 4;

/// Mutable file state guarded by one mutex. Reads of already-allocated
/// pages only touch it for the range check.
#[derive(Debug)]
struct FileState {
    /// Highest allocated page id.
    last_page_id: PageId,
    /// Head of the free-list chain, `NO_PAGE` when empty.
    free_head: PageId,
    /// Root of the dictionary page chain, `NO_PAGE` before first use.
    dictionary_root: PageId,
    /// Current physical file length in bytes.
    file_len: u64,
}

/// Exclusive owner of the backing file descriptor and the page cache.
#[derive(Debug)]
pub struct PageFile {
    file: File,
    path: PathBuf,
    page_size: usize,
    grow_block_bytes: usize,
    state: Mutex<FileState>,
    cache: PageCache,
}

impl PageFile {
    /// Create a new database file or open an existing one.
    ///
    /// Opening validates the stored page size against `options`; a mismatch
    /// is `InvalidFormat`. A live lock held by another process is
    /// `AlreadyOpen`.
    pub fn create(cx: &Cx, path: &Path, options: &Options) -> Result<Self> {
        cx.checkpoint()?;
        options.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive().map_err(|err| {
            if err.kind() == ErrorKind::WouldBlock {
                BliteError::AlreadyOpen
            } else {
                BliteError::Io(err)
            }
        })?;

        let file_len = file.metadata()?.len();
        let mut page_file = Self {
            file,
            path: path.to_owned(),
            page_size: options.page_size,
            grow_block_bytes: options.grow_block_bytes,
            state: Mutex::new(FileState {
                last_page_id: CATALOG_PAGE_ID,
                free_head: NO_PAGE,
                dictionary_root: NO_PAGE,
                file_len,
            }),
            cache: PageCache::new(options.cache_pages),
        };

        if file_len == 0 {
            page_file.initialize(cx)?;
            info!(path = %path.display(), page_size = options.page_size, "created database file");
        } else {
            page_file.load_header(cx, options)?;
            info!(path = %path.display(), "opened database file");
        }
        Ok(page_file)
    }

    /// Physical page size of this database.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest allocated page id.
    #[must_use]
    pub fn last_page_id(&self) -> PageId {
        self.state.lock().last_page_id
    }

    /// Root of the dictionary chain, `NO_PAGE` when unset.
    #[must_use]
    pub fn dictionary_root(&self) -> PageId {
        self.state.lock().dictionary_root
    }

    /// Persist a new dictionary chain root in the file header.
    pub fn set_dictionary_root(&self, cx: &Cx, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        state.dictionary_root = page_id;
        self.write_file_header(cx, &state)
    }

    // -----------------------------------------------------------------------
    // Raw page I/O
    // -----------------------------------------------------------------------

    /// Fill `buf` with the page's bytes, validating the checksum and that
    /// the stored page id matches the offset.
    pub fn read_into(&self, cx: &Cx, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        cx.checkpoint()?;
        self.check_in_range(page_id)?;
        if buf.len() < self.page_size {
            return Err(BliteError::internal("read buffer smaller than a page"));
        }

        if let Some(cached) = self.cache.get(page_id) {
            buf[..self.page_size].copy_from_slice(&cached);
            return Ok(());
        }

        let offset = u64::from(page_id) * self.page_size as u64;
        self.file.read_exact_at(&mut buf[..self.page_size], offset)?;
        verify_checksum(page_id, &buf[..self.page_size])?;
        let header = PageHeader::read(buf)?;
        if header.page_id != page_id {
            return Err(BliteError::invalid_format(format!(
                "page at offset {offset} claims id {} (expected {page_id})",
                header.page_id
            )));
        }
        self.cache
            .insert(page_id, Arc::new(buf[..self.page_size].to_vec()));
        Ok(())
    }

    /// Read a page into a fresh shared buffer.
    pub fn read(&self, cx: &Cx, page_id: PageId) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) = self.cache.get(page_id) {
            cx.checkpoint()?;
            self.check_in_range(page_id)?;
            return Ok(cached);
        }
        let mut buf = vec![0_u8; self.page_size];
        self.read_into(cx, page_id, &mut buf)?;
        Ok(Arc::new(buf))
    }

    /// Write a full page image at its offset. The checksum field is
    /// restamped from the buffer contents before the write, which is why
    /// the image is taken by mutable reference.
    pub fn write(&self, cx: &Cx, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        cx.checkpoint()?;
        self.check_in_range(page_id)?;
        if buf.len() < self.page_size {
            return Err(BliteError::internal("write buffer smaller than a page"));
        }
        stamp_checksum(&mut buf[..self.page_size]);
        let offset = u64::from(page_id) * self.page_size as u64;
        self.file.write_all_at(&buf[..self.page_size], offset)?;
        self.cache
            .insert(page_id, Arc::new(buf[..self.page_size].to_vec()));
        Ok(())
    }

    /// Fsync the data file.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        self.file.sync_all()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate a page: pop the free-list when possible, otherwise extend
    /// the file (in whole grow-blocks). The page is stamped with a fresh
    /// header of `page_type` and durably zeroed.
    pub fn allocate_page(&self, cx: &Cx, page_type: PageType) -> Result<PageId> {
        cx.checkpoint()?;
        let mut state = self.state.lock();

        let page_id = if state.free_head == NO_PAGE {
            let page_id = state.last_page_id + 1;
            let needed = (u64::from(page_id) + 1) * self.page_size as u64;
            if needed > state.file_len {
                // Extend by exactly one fresh grow-block.
                let new_len = needed.div_ceil(self.grow_block_bytes as u64)
                    * self.grow_block_bytes as u64;
                self.file.set_len(new_len)?;
                state.file_len = new_len;
                debug!(new_len, "extended database file");
            }
            state.last_page_id = page_id;
            page_id
        } else {
            // Reuse the free-list head; its next pointer becomes the new head.
            let head = state.free_head;
            let mut buf = vec![0_u8; self.page_size];
            let offset = u64::from(head) * self.page_size as u64;
            self.file.read_exact_at(&mut buf, offset)?;
            let header = PageHeader::read(&buf)?;
            if header.page_type != PageType::Free {
                return Err(BliteError::invalid_format(format!(
                    "free-list page {head} is not marked Free"
                )));
            }
            state.free_head = header.next_page_id;
            head
        };

        let mut buf = vec![0_u8; self.page_size];
        PageHeader::new(page_id, page_type).write(&mut buf);
        stamp_checksum(&mut buf);
        let offset = u64::from(page_id) * self.page_size as u64;
        self.file.write_all_at(&buf, offset)?;
        self.cache.insert(page_id, Arc::new(buf));

        self.write_file_header(cx, &state)?;
        debug!(page_id, page_type = ?page_type, "allocated page");
        Ok(page_id)
    }

    /// Return a page to the free-list. Reserved pages cannot be freed.
    pub fn free_page(&self, cx: &Cx, page_id: PageId) -> Result<()> {
        cx.checkpoint()?;
        if page_id == HEADER_PAGE_ID || page_id == CATALOG_PAGE_ID {
            return Err(BliteError::internal(format!(
                "cannot free reserved page {page_id}"
            )));
        }
        let mut state = self.state.lock();
        if page_id > state.last_page_id {
            return Err(BliteError::PageOutOfRange {
                page_id,
                allocated: state.last_page_id + 1,
            });
        }

        let mut buf = vec![0_u8; self.page_size];
        let mut header = PageHeader::new(page_id, PageType::Free);
        header.next_page_id = state.free_head;
        header.write(&mut buf);
        stamp_checksum(&mut buf);
        let offset = u64::from(page_id) * self.page_size as u64;
        self.file.write_all_at(&buf, offset)?;
        self.cache.remove(page_id);

        state.free_head = page_id;
        self.write_file_header(cx, &state)?;
        debug!(page_id, "freed page");
        Ok(())
    }

    /// Make sure `page_id` lies inside the physical file, extending it when
    /// needed. Checkpoint replay uses this for pages allocated after the
    /// header page was last written.
    pub fn ensure_allocated(&self, cx: &Cx, page_id: PageId) -> Result<()> {
        cx.checkpoint()?;
        let mut state = self.state.lock();
        if page_id <= state.last_page_id {
            return Ok(());
        }
        let needed = (u64::from(page_id) + 1) * self.page_size as u64;
        if needed > state.file_len {
            let new_len =
                needed.div_ceil(self.grow_block_bytes as u64) * self.grow_block_bytes as u64;
            self.file.set_len(new_len)?;
            state.file_len = new_len;
        }
        state.last_page_id = page_id;
        self.write_file_header(cx, &state)
    }

    /// Drop every cached page image (used after checkpoint replay).
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn check_in_range(&self, page_id: PageId) -> Result<()> {
        let state = self.state.lock();
        if page_id > state.last_page_id {
            return Err(BliteError::PageOutOfRange {
                page_id,
                allocated: state.last_page_id + 1,
            });
        }
        Ok(())
    }

    /// Lay out pages 0 and 1 of a fresh file.
    fn initialize(&mut self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        self.file.set_len(self.grow_block_bytes as u64)?;
        {
            let mut state = self.state.lock();
            state.file_len = self.grow_block_bytes as u64;
            state.last_page_id = CATALOG_PAGE_ID;
            self.write_file_header(cx, &state)?;
        }

        let mut buf = vec![0_u8; self.page_size];
        PageHeader::new(CATALOG_PAGE_ID, PageType::CollectionCatalog).write(&mut buf);
        stamp_checksum(&mut buf);
        self.file
            .write_all_at(&buf, u64::from(CATALOG_PAGE_ID) * self.page_size as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Validate and load the header page of an existing file.
    fn load_header(&mut self, cx: &Cx, options: &Options) -> Result<()> {
        cx.checkpoint()?;
        let mut buf = vec![0_u8; self.page_size];
        self.file.read_exact_at(&mut buf, 0).map_err(|_| {
            BliteError::invalid_format("file too short for a header page")
        })?;
        verify_checksum(HEADER_PAGE_ID, &buf)?;

        let header = PageHeader::read(&buf)?;
        if header.page_type != PageType::FileHeader {
            return Err(BliteError::invalid_format("page 0 is not a file header"));
        }
        if &buf[P_MAGIC..P_MAGIC + MAGIC.len()] != MAGIC {
            return Err(BliteError::invalid_format("missing format magic"));
        }
        if buf[P_VERSION] != FORMAT_VERSION {
            return Err(BliteError::invalid_format(format!(
                "unsupported format version {}",
                buf[P_VERSION]
            )));
        }
        let stored_page_size = u32::from_le_bytes([
            buf[P_PAGE_SIZE],
            buf[P_PAGE_SIZE + 1],
            buf[P_PAGE_SIZE + 2],
            buf[P_PAGE_SIZE + 3],
        ]) as usize;
        if stored_page_size != options.page_size {
            return Err(BliteError::invalid_format(format!(
                "file uses page size {stored_page_size}, caller requested {}",
                options.page_size
            )));
        }

        let mut state = self.state.lock();
        state.free_head = header.next_page_id;
        state.dictionary_root = header.dictionary_root;
        state.last_page_id = u32::from_le_bytes([
            buf[P_LAST_PAGE_ID],
            buf[P_LAST_PAGE_ID + 1],
            buf[P_LAST_PAGE_ID + 2],
            buf[P_LAST_PAGE_ID + 3],
        ]);
        Ok(())
    }

    /// Rewrite page 0 from the in-memory state.
    fn write_file_header(&self, cx: &Cx, state: &FileState) -> Result<()> {
        cx.checkpoint()?;
        let mut buf = vec![0_u8; self.page_size];
        let mut header = PageHeader::new(HEADER_PAGE_ID, PageType::FileHeader);
        header.next_page_id = state.free_head;
        header.dictionary_root = state.dictionary_root;
        header.write(&mut buf);

        buf[P_MAGIC..P_MAGIC + MAGIC.len()].copy_from_slice(MAGIC);
        buf[P_VERSION] = FORMAT_VERSION;
        buf[P_PAGE_SIZE..P_PAGE_SIZE + 4]
            .copy_from_slice(&(self.page_size as u32).to_le_bytes());
        buf[P_GROW_BLOCK..P_GROW_BLOCK + 4]
            .copy_from_slice(&(self.grow_block_bytes as u32).to_le_bytes());
        buf[P_LAST_PAGE_ID..P_LAST_PAGE_ID + 4]
            .copy_from_slice(&state.last_page_id.to_le_bytes());

        stamp_checksum(&mut buf);
        self.file.write_all_at(&buf, 0)?;
        self.cache.insert(HEADER_PAGE_ID, Arc::new(buf));
        Ok(())
    }
}

impl Drop for PageFile {
    fn drop(&mut self) {
        // The advisory lock dies with the descriptor; unlock explicitly so
        // a same-process reopen does not race the close.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_options() -> Options {
        // Small grow block keeps test files compact.
        Options::default()
            .with_page_size(8192)
            .with_grow_block_bytes(8192 * 4)
    }

    fn open(dir: &TempDir) -> PageFile {
        let cx = Cx::new();
        PageFile::create(&cx, &dir.path().join("test.db"), &small_options()).unwrap()
    }

    #[test]
    fn test_create_lays_out_reserved_pages() {
        let dir = TempDir::new().unwrap();
        let pf = open(&dir);
        let cx = Cx::new();
        assert_eq!(pf.last_page_id(), CATALOG_PAGE_ID);

        let header = PageHeader::read(&pf.read(&cx, HEADER_PAGE_ID).unwrap()).unwrap();
        assert_eq!(header.page_type, PageType::FileHeader);
        let catalog = PageHeader::read(&pf.read(&cx, CATALOG_PAGE_ID).unwrap()).unwrap();
        assert_eq!(catalog.page_type, PageType::CollectionCatalog);
    }

    #[test]
    fn test_reopen_validates_page_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let cx = Cx::new();
        drop(PageFile::create(&cx, &path, &small_options()).unwrap());

        let mismatched = Options::default()
            .with_page_size(16384)
            .with_grow_block_bytes(16384 * 4);
        let err = PageFile::create(&cx, &path, &mismatched).unwrap_err();
        assert!(matches!(err, BliteError::InvalidFormat { .. }));
    }

    #[test]
    fn test_second_open_is_rejected_while_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let cx = Cx::new();
        let _held = PageFile::create(&cx, &path, &small_options()).unwrap();
        let err = PageFile::create(&cx, &path, &small_options()).unwrap_err();
        assert!(matches!(err, BliteError::AlreadyOpen));
    }

    #[test]
    fn test_allocate_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let pf = open(&dir);
        let cx = Cx::new();

        let page_id = pf.allocate_page(&cx, PageType::Data).unwrap();
        assert_eq!(page_id, 2);

        let mut image = pf.read(&cx, page_id).unwrap().as_ref().clone();
        image[100] = 0xCD;
        pf.write(&cx, page_id, &mut image).unwrap();

        let back = pf.read(&cx, page_id).unwrap();
        assert_eq!(back[100], 0xCD);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let pf = open(&dir);
        let cx = Cx::new();
        let err = pf.read(&cx, 99).unwrap_err();
        assert!(matches!(err, BliteError::PageOutOfRange { page_id: 99, .. }));
    }

    #[test]
    fn test_free_list_reuses_pages() {
        let dir = TempDir::new().unwrap();
        let pf = open(&dir);
        let cx = Cx::new();

        let a = pf.allocate_page(&cx, PageType::Data).unwrap();
        let b = pf.allocate_page(&cx, PageType::Data).unwrap();
        pf.free_page(&cx, a).unwrap();
        pf.free_page(&cx, b).unwrap();

        // LIFO: b comes back first, re-stamped with the new type.
        let c = pf.allocate_page(&cx, PageType::Index).unwrap();
        assert_eq!(c, b);
        let header = PageHeader::read(&pf.read(&cx, c).unwrap()).unwrap();
        assert_eq!(header.page_type, PageType::Index);
        let d = pf.allocate_page(&cx, PageType::Index).unwrap();
        assert_eq!(d, a);
        // Free list exhausted; next allocation extends.
        let e = pf.allocate_page(&cx, PageType::Index).unwrap();
        assert_eq!(e, b + 1);
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let cx = Cx::new();
        let freed;
        {
            let pf = PageFile::create(&cx, &path, &small_options()).unwrap();
            freed = pf.allocate_page(&cx, PageType::Data).unwrap();
            pf.allocate_page(&cx, PageType::Data).unwrap();
            pf.free_page(&cx, freed).unwrap();
            pf.flush(&cx).unwrap();
        }
        let pf = PageFile::create(&cx, &path, &small_options()).unwrap();
        assert_eq!(pf.allocate_page(&cx, PageType::Data).unwrap(), freed);
    }

    #[test]
    fn test_growth_is_block_aligned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let cx = Cx::new();
        let pf = PageFile::create(&cx, &path, &small_options()).unwrap();

        // Pages 2 and 3 still fit in the first block.
        pf.allocate_page(&cx, PageType::Data).unwrap();
        pf.allocate_page(&cx, PageType::Data).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192 * 4);
        // Page 4 crosses the boundary and grows by exactly one block.
        pf.allocate_page(&cx, PageType::Data).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192 * 8);
    }

    #[test]
    fn test_corrupted_page_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let cx = Cx::new();
        let page_id;
        {
            let pf = PageFile::create(&cx, &path, &small_options()).unwrap();
            page_id = pf.allocate_page(&cx, PageType::Data).unwrap();
            pf.flush(&cx).unwrap();
        }
        // Flip a byte in the page body behind the engine's back.
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all_at(&[0xFF], u64::from(page_id) * 8192 + 500)
                .unwrap();
        }
        let pf = PageFile::create(&cx, &path, &small_options()).unwrap();
        let err = pf.read(&cx, page_id).unwrap_err();
        assert!(matches!(err, BliteError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_cancellation_blocks_io() {
        let dir = TempDir::new().unwrap();
        let pf = open(&dir);
        let cx = Cx::new();
        cx.cancel();
        assert!(matches!(
            pf.read(&cx, HEADER_PAGE_ID).unwrap_err(),
            BliteError::Cancelled
        ));
        assert!(matches!(
            pf.allocate_page(&cx, PageType::Data).unwrap_err(),
            BliteError::Cancelled
        ));
    }
}
