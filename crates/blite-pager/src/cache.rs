//! Bounded cache of page images keyed by page id.
//!
//! Purely a read accelerator: every write to a page evicts or replaces its
//! entry, and checksum validation still happens on the cold path. Shared
//! pages hand out `Arc`s so readers never copy.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use blite_types::PageId;
use lru::LruCache;
use parking_lot::Mutex;

/// LRU over `Arc`'d page images.
pub struct PageCache {
    inner: Mutex<LruCache<PageId, Arc<Vec<u8>>>>,
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

impl PageCache {
    /// Cache bounded to `capacity` pages (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a cached image, promoting it to most-recently-used.
    #[must_use]
    pub fn get(&self, page_id: PageId) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().get(&page_id).cloned()
    }

    /// Install (or replace) the image for a page.
    pub fn insert(&self, page_id: PageId, image: Arc<Vec<u8>>) {
        self.inner.lock().put(page_id, image);
    }

    /// Drop a page's entry, if present.
    pub fn remove(&self, page_id: PageId) {
        self.inner.lock().pop(&page_id);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache = PageCache::new(4);
        cache.insert(3, Arc::new(vec![1, 2, 3]));
        assert_eq!(cache.get(3).unwrap().as_slice(), &[1, 2, 3]);
        cache.remove(3);
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache = PageCache::new(2);
        cache.insert(1, Arc::new(vec![1]));
        cache.insert(2, Arc::new(vec![2]));
        let _ = cache.get(1); // promote 1
        cache.insert(3, Arc::new(vec![3]));
        assert!(cache.get(2).is_none(), "page 2 was least recently used");
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }
}
