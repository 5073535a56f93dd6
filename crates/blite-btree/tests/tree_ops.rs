//! End-to-end tree behavior over a real page file: ordering, splits,
//! sibling links, duplicates, and removal.

use std::sync::Arc;

use blite_btree::BTree;
use blite_pager::PageFile;
use blite_txn::{IsolationLevel, Transaction, TxnManager};
use blite_types::{Cx, DocumentLocation, IndexKey, Options};
use blite_wal::Wal;
use tempfile::TempDir;

const PAGE_SIZE: usize = 8192;

struct Fixture {
    _dir: TempDir,
    mgr: Arc<TxnManager>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cx = Cx::new();
        let options = Options::default()
            .with_page_size(PAGE_SIZE)
            .with_grow_block_bytes(PAGE_SIZE * 16);
        let page_file =
            Arc::new(PageFile::create(&cx, &dir.path().join("t.db"), &options).unwrap());
        let wal = Arc::new(Wal::new(&dir.path().join("t.db.wal")));
        Self {
            _dir: dir,
            mgr: TxnManager::new(page_file, wal),
        }
    }

    fn begin(&self) -> Transaction {
        self.mgr
            .begin(&Cx::new(), IsolationLevel::ReadCommitted)
            .unwrap()
    }

    fn create_tree(&self, unique: bool) -> BTree {
        let cx = Cx::new();
        let mut txn = self.begin();
        let root = BTree::create_root(&cx, &mut txn).unwrap();
        txn.prepare(&cx).unwrap();
        txn.commit(&cx).unwrap();
        BTree::new(root, unique, "test_idx", PAGE_SIZE)
    }
}

fn loc(n: u32) -> DocumentLocation {
    DocumentLocation::new(100 + n, (n % 7) as u16)
}

/// Fat keys force splits with few entries: 5 order-preserving digits plus
/// padding.
fn fat_key(n: u32) -> IndexKey {
    let mut bytes = format!("{n:05}").into_bytes();
    bytes.resize(400, b'x');
    IndexKey::from_bytes(bytes)
}

#[test]
fn test_insert_seek_small() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    for n in [5_u32, 1, 9, 3, 7] {
        tree.insert(&cx, &mut txn, &IndexKey::from_i64(i64::from(n)), loc(n))
            .unwrap();
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    for n in [1_u32, 3, 5, 7, 9] {
        let found = tree
            .seek(&cx, &fx.mgr, None, &IndexKey::from_i64(i64::from(n)))
            .unwrap();
        assert_eq!(found, Some(loc(n)), "key {n}");
    }
    assert_eq!(tree.seek(&cx, &fx.mgr, None, &IndexKey::from_i64(4)).unwrap(), None);
}

#[test]
fn test_duplicate_key_on_unique_tree() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    let key = IndexKey::from_i64(42);
    tree.insert(&cx, &mut txn, &key, loc(1)).unwrap();
    let err = tree.insert(&cx, &mut txn, &key, loc(2)).unwrap_err();
    assert!(matches!(err, blite_error::BliteError::DuplicateKey { .. }));
}

#[test]
fn test_read_your_own_writes_before_commit() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    tree.insert(&cx, &mut txn, &IndexKey::from_i64(1), loc(1)).unwrap();

    // Visible through the transaction, invisible outside it.
    let inside = tree.seek(&cx, &fx.mgr, Some(&txn), &IndexKey::from_i64(1)).unwrap();
    assert_eq!(inside, Some(loc(1)));
    let outside = tree.seek(&cx, &fx.mgr, None, &IndexKey::from_i64(1)).unwrap();
    assert_eq!(outside, None);
}

#[test]
fn test_range_inclusive_bounds() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    for n in 1..=1000_u32 {
        tree.insert(&cx, &mut txn, &IndexKey::from_i64(i64::from(n)), loc(n))
            .unwrap();
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    let results: Vec<_> = tree
        .range(
            &cx,
            &fx.mgr,
            None,
            Some(&IndexKey::from_i64(250)),
            Some(&IndexKey::from_i64(500)),
        )
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(results.len(), 251);
    assert_eq!(results.first().unwrap().1, loc(250));
    assert_eq!(results.last().unwrap().1, loc(500));
    let keys: Vec<_> = results.iter().map(|(k, _)| k.clone()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "range must come back in ascending key order");
}

#[test]
fn test_open_ended_ranges() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    for n in 1..=50_u32 {
        tree.insert(&cx, &mut txn, &IndexKey::from_i64(i64::from(n)), loc(n))
            .unwrap();
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    let all: Vec<_> = tree
        .range(&cx, &fx.mgr, None, None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 50);

    let tail: Vec<_> = tree
        .range(&cx, &fx.mgr, None, Some(&IndexKey::from_i64(45)), None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(tail.len(), 6);

    let head: Vec<_> = tree
        .range(&cx, &fx.mgr, None, None, Some(&IndexKey::from_i64(5)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(head.len(), 5);
}

#[test]
fn test_splits_preserve_order_and_lookups() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    // Fat keys overflow leaves after ~19 entries, and the root's entry
    // table after ~20 leaves, so this covers leaf, internal, and root
    // splits at both levels.
    let mut txn = fx.begin();
    let mut order: Vec<u32> = (0..1500).collect();
    // Deterministic shuffle: stride through the range coprime to its size.
    order.sort_by_key(|n| (n.wrapping_mul(769)) % 1500);
    for &n in &order {
        tree.insert(&cx, &mut txn, &fat_key(n), loc(n)).unwrap();
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    for n in (0..1500).step_by(97) {
        assert_eq!(
            tree.seek(&cx, &fx.mgr, None, &fat_key(n)).unwrap(),
            Some(loc(n)),
            "key {n} lost after splits"
        );
    }

    let all: Vec<_> = tree
        .range(&cx, &fx.mgr, None, None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 1500);
    for (n, (key, found)) in all.iter().enumerate() {
        assert_eq!(key, fat_key(n as u32).as_bytes());
        assert_eq!(*found, loc(n as u32));
    }
}

#[test]
fn test_remove_is_inverse_of_insert() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    for n in 1..=100_u32 {
        tree.insert(&cx, &mut txn, &IndexKey::from_i64(i64::from(n)), loc(n))
            .unwrap();
    }
    for n in 1..=100_u32 {
        let removed = tree
            .remove(&cx, &mut txn, &IndexKey::from_i64(i64::from(n)))
            .unwrap();
        assert_eq!(removed, loc(n));
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    let all: Vec<_> = tree
        .range(&cx, &fx.mgr, None, None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(all.is_empty());
    assert_eq!(tree.seek(&cx, &fx.mgr, None, &IndexKey::from_i64(50)).unwrap(), None);
}

#[test]
fn test_remove_missing_key_is_not_found() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();
    let mut txn = fx.begin();
    let err = tree
        .remove(&cx, &mut txn, &IndexKey::from_i64(404))
        .unwrap_err();
    assert!(matches!(err, blite_error::BliteError::NotFound { .. }));
}

#[test]
fn test_non_unique_composite_find_all() {
    let fx = Fixture::new();
    let tree = fx.create_tree(false);
    let cx = Cx::new();

    let user_key = IndexKey::from_str_key("red");
    let other_key = IndexKey::from_str_key("redder");
    let mut txn = fx.begin();
    for n in 0..5_u32 {
        tree.insert(&cx, &mut txn, &user_key.composite(loc(n)), loc(n))
            .unwrap();
    }
    tree.insert(&cx, &mut txn, &other_key.composite(loc(9)), loc(9))
        .unwrap();
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    let found = tree.find_all(&cx, &fx.mgr, None, &user_key).unwrap();
    assert_eq!(found.len(), 5, "'redder' must not leak into 'red' lookups");
    let expected: Vec<_> = (0..5_u32).map(loc).collect();
    let mut sorted = found.clone();
    sorted.sort();
    let mut expected_sorted = expected;
    expected_sorted.sort();
    assert_eq!(sorted, expected_sorted);
}

#[test]
fn test_prefix_scan() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    for word in ["apple", "apricot", "banana", "application", "apex"] {
        tree.insert(
            &cx,
            &mut txn,
            &IndexKey::from_str_key(word),
            loc(word.len() as u32),
        )
        .unwrap();
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    let prefix = IndexKey::from_bytes(b"ap".to_vec());
    let hits: Vec<_> = tree
        .prefix(&cx, &fx.mgr, None, &prefix)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(hits.len(), 4);
    assert!(hits.iter().all(|(key, _)| key.starts_with(b"ap")));
}

#[test]
fn test_leaf_links_survive_many_splits() {
    let fx = Fixture::new();
    let tree = fx.create_tree(true);
    let cx = Cx::new();

    let mut txn = fx.begin();
    for n in 0..600_u32 {
        tree.insert(&cx, &mut txn, &fat_key(n), loc(n)).unwrap();
    }
    txn.prepare(&cx).unwrap();
    txn.commit(&cx).unwrap();

    // A full forward walk sees every key exactly once, in order; this
    // only holds if next-leaf links were maintained through every split.
    let walked: Vec<_> = tree
        .range(&cx, &fx.mgr, None, None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(walked.len(), 600);
    for (n, (key, _)) in walked.iter().enumerate() {
        assert_eq!(key, fat_key(n as u32).as_bytes());
    }
}
