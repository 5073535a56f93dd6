//! Collection-level behavior: CRUD, bulk inserts, ranges, secondary
//! indexes, scans, change feeds, and collection lifecycle.

use std::fs;

use blite_bson::{BsonValue, Document};
use blite_core::{CheckpointMode, Database, KeyType};
use blite_error::BliteError;
use blite_pager::{SlottedPage, overflow};
use blite_txn::{ChangeOp, IsolationLevel, TxnState};
use blite_types::{Cx, NO_PAGE, Options};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Database {
    let cx = Cx::new();
    Database::open(&cx, &dir.path().join("a.db"), Options::default()).unwrap()
}

fn doc(id: i64, name: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("_id", id);
    doc.insert("name", name);
    doc
}

#[test]
fn test_insert_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let users = db.create_collection(&cx, "users", KeyType::Int64).unwrap();

    let alice = doc(1, "Alice");
    let id = users.insert(&cx, alice.clone(), None).unwrap();
    assert_eq!(id, BsonValue::Int64(1));

    let found = users.get(&cx, &id, None).unwrap().unwrap();
    assert_eq!(found, alice);
    assert_eq!(users.count(&cx).unwrap(), 1);
    assert!(users.get(&cx, &BsonValue::Int64(2), None).unwrap().is_none());
}

#[test]
fn test_missing_id_gets_an_object_id() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let events = db.create_collection(&cx, "events", KeyType::ObjectId).unwrap();

    let mut payload = Document::new();
    payload.insert("kind", "login");
    let id = events.insert(&cx, payload, None).unwrap();
    assert!(matches!(id, BsonValue::ObjectId(_)));
    let found = events.get(&cx, &id, None).unwrap().unwrap();
    assert_eq!(found.get("kind"), Some(&BsonValue::String("login".into())));
    assert_eq!(found.get("_id"), Some(&id));
}

#[test]
fn test_bulk_insert_and_range() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    let docs: Vec<Document> = (1..=1000_i64).map(|n| doc(n, "row")).collect();
    let ids = c.insert_bulk(&cx, docs, None).unwrap();
    assert_eq!(ids.len(), 1000);
    assert_eq!(c.count(&cx).unwrap(), 1000);

    let results = c
        .range(
            &cx,
            Some(&BsonValue::Int64(250)),
            Some(&BsonValue::Int64(500)),
            None,
        )
        .unwrap();
    assert_eq!(results.len(), 251);
    assert_eq!(results.first().unwrap().get("_id"), Some(&BsonValue::Int64(250)));
    assert_eq!(results.last().unwrap().get("_id"), Some(&BsonValue::Int64(500)));
    let ids: Vec<i64> = results
        .iter()
        .map(|d| d.get("_id").and_then(BsonValue::as_i64).unwrap())
        .collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted, "range results must ascend");
}

#[test]
fn test_duplicate_key_leaves_txn_active() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    c.insert(&cx, doc(1, "first"), None).unwrap();

    let mut txn = db.begin(&cx, IsolationLevel::ReadCommitted).unwrap();
    let err = c.insert(&cx, doc(1, "second"), Some(&mut txn)).unwrap_err();
    assert!(matches!(err, BliteError::DuplicateKey { .. }));
    // The failing transaction is still Active and rolls back cleanly.
    assert_eq!(txn.state(), TxnState::Active);
    db.rollback(&cx, txn);

    assert_eq!(c.count(&cx).unwrap(), 1);
    let kept = c.get(&cx, &BsonValue::Int64(1), None).unwrap().unwrap();
    assert_eq!(kept.get("name"), Some(&BsonValue::String("first".into())));
}

#[test]
fn test_update_in_place_and_relocation() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    c.insert(&cx, doc(1, "a-fairly-long-initial-name"), None).unwrap();

    // Shrinking rewrite stays in place.
    c.update(&cx, &BsonValue::Int64(1), doc(1, "tiny"), None).unwrap();
    let got = c.get(&cx, &BsonValue::Int64(1), None).unwrap().unwrap();
    assert_eq!(got.get("name"), Some(&BsonValue::String("tiny".into())));

    // Growing rewrite relocates; the document stays reachable.
    let mut grown = doc(1, "tiny");
    grown.insert("extra", "x".repeat(512));
    c.update(&cx, &BsonValue::Int64(1), grown.clone(), None).unwrap();
    let got = c.get(&cx, &BsonValue::Int64(1), None).unwrap().unwrap();
    assert_eq!(got, grown);
    assert_eq!(c.count(&cx).unwrap(), 1);
}

#[test]
fn test_update_missing_is_not_found() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    let err = c.update(&cx, &BsonValue::Int64(9), doc(9, "x"), None).unwrap_err();
    assert!(matches!(err, BliteError::NotFound { .. }));
}

#[test]
fn test_delete_removes_document_and_count() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    c.insert(&cx, doc(1, "a"), None).unwrap();
    c.insert(&cx, doc(2, "b"), None).unwrap();
    c.delete(&cx, &BsonValue::Int64(1), None).unwrap();

    assert_eq!(c.count(&cx).unwrap(), 1);
    assert!(c.get(&cx, &BsonValue::Int64(1), None).unwrap().is_none());
    assert!(c.get(&cx, &BsonValue::Int64(2), None).unwrap().is_some());
    let err = c.delete(&cx, &BsonValue::Int64(1), None).unwrap_err();
    assert!(matches!(err, BliteError::NotFound { .. }));
}

#[test]
fn test_scan_with_raw_predicate() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    for n in 1..=20_i64 {
        let mut d = doc(n, if n % 2 == 0 { "even" } else { "odd" });
        d.insert("n", n);
        c.insert(&cx, d, None).unwrap();
    }

    // Field test on the raw bytes; rejected documents are never decoded.
    let evens = c
        .scan(&cx, None, |schema, bytes| {
            let mut keep = false;
            blite_bson::scan(bytes, schema, |name, code, slice| {
                if name == "n" {
                    if let Ok(value) = blite_bson::decode_value(code, slice, schema) {
                        keep = value.as_i64().is_some_and(|v| v % 2 == 0);
                    }
                    return false;
                }
                true
            })
            .unwrap();
            Ok(keep)
        })
        .unwrap();
    assert_eq!(evens.len(), 10);
    assert!(
        evens
            .iter()
            .all(|d| d.get("n").and_then(BsonValue::as_i64).unwrap() % 2 == 0)
    );

    let everyone = c.scan_all(&cx, None).unwrap();
    assert_eq!(everyone.len(), 20);
}

#[test]
fn test_explicit_txn_read_your_own_writes() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    let mut txn = db.begin(&cx, IsolationLevel::ReadCommitted).unwrap();
    c.insert(&cx, doc(7, "ghost"), Some(&mut txn)).unwrap();

    // Visible inside, invisible outside.
    assert!(c.get(&cx, &BsonValue::Int64(7), Some(&txn)).unwrap().is_some());
    assert!(c.get(&cx, &BsonValue::Int64(7), None).unwrap().is_none());

    db.commit(&cx, txn).unwrap();
    assert!(c.get(&cx, &BsonValue::Int64(7), None).unwrap().is_some());
}

#[test]
fn test_rollback_discards_collection_writes() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    let mut txn = db.begin(&cx, IsolationLevel::ReadCommitted).unwrap();
    c.insert(&cx, doc(1, "a"), Some(&mut txn)).unwrap();
    c.insert(&cx, doc(2, "b"), Some(&mut txn)).unwrap();
    db.rollback(&cx, txn);

    assert_eq!(c.count(&cx).unwrap(), 0);
    assert!(c.get(&cx, &BsonValue::Int64(1), None).unwrap().is_none());
}

#[test]
fn test_secondary_index_backfill_and_lookup() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    for n in 1..=10_i64 {
        let mut d = doc(n, "row");
        d.insert("bucket", n % 3);
        c.insert(&cx, d, None).unwrap();
    }

    // Created after the fact, so it must backfill.
    c.ensure_index(&cx, "bucket", false).unwrap();
    let hits = c
        .find_by_index(&cx, "bucket", &BsonValue::Int64(1), None)
        .unwrap();
    assert_eq!(hits.len(), 4); // 1, 4, 7, 10

    // Maintained on subsequent inserts and deletes.
    let mut d = doc(11, "row");
    d.insert("bucket", 1_i64);
    c.insert(&cx, d, None).unwrap();
    c.delete(&cx, &BsonValue::Int64(4), None).unwrap();
    let hits = c
        .find_by_index(&cx, "bucket", &BsonValue::Int64(1), None)
        .unwrap();
    assert_eq!(hits.len(), 4); // 1, 7, 10, 11

    // Idempotent re-declaration.
    c.ensure_index(&cx, "bucket", false).unwrap();
    assert_eq!(c.indexes(&cx).unwrap().len(), 1);
}

#[test]
fn test_unique_secondary_index_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    c.ensure_index(&cx, "email", true).unwrap();

    let mut first = doc(1, "a");
    first.insert("email", "a@example.com");
    c.insert(&cx, first, None).unwrap();

    let mut second = doc(2, "b");
    second.insert("email", "a@example.com");
    let err = c.insert(&cx, second, None).unwrap_err();
    assert!(matches!(err, BliteError::DuplicateKey { .. }));
    assert_eq!(c.count(&cx).unwrap(), 1);
}

#[test]
fn test_drop_index() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    c.ensure_index(&cx, "bucket", false).unwrap();
    c.drop_index(&cx, "bucket").unwrap();
    assert!(c.indexes(&cx).unwrap().is_empty());
    assert!(matches!(
        c.find_by_index(&cx, "bucket", &BsonValue::Int64(1), None),
        Err(BliteError::NotFound { .. })
    ));
}

#[test]
fn test_update_rewrites_secondary_entries() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    c.ensure_index(&cx, "team", false).unwrap();

    let mut d = doc(1, "dev");
    d.insert("team", "red");
    c.insert(&cx, d, None).unwrap();

    let mut moved = doc(1, "dev");
    moved.insert("team", "blue");
    c.update(&cx, &BsonValue::Int64(1), moved, None).unwrap();

    assert!(c.find_by_index(&cx, "team", &BsonValue::String("red".into()), None)
        .unwrap()
        .is_empty());
    assert_eq!(
        c.find_by_index(&cx, "team", &BsonValue::String("blue".into()), None)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_collection_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();

    db.create_collection(&cx, "users", KeyType::Int64).unwrap();
    db.create_collection(&cx, "orders", KeyType::ObjectId).unwrap();
    assert_eq!(db.collections(), vec!["orders".to_owned(), "users".to_owned()]);

    let err = db.create_collection(&cx, "users", KeyType::Int64).unwrap_err();
    assert!(matches!(err, BliteError::Exists { .. }));

    let users = db.collection("users").unwrap();
    users.insert(&cx, doc(1, "a"), None).unwrap();
    db.drop_collection(&cx, "users").unwrap();
    assert_eq!(db.collections(), vec!["orders".to_owned()]);
    assert!(matches!(db.collection("users"), Err(BliteError::NotFound { .. })));

    // The name can be reused and the freed pages recycled.
    let again = db.create_collection(&cx, "users", KeyType::Int64).unwrap();
    again.insert(&cx, doc(1, "fresh"), None).unwrap();
    assert_eq!(again.count(&cx).unwrap(), 1);
}

#[test]
fn test_change_feed_order_and_payloads() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    let sub = c.subscribe();

    c.insert(&cx, doc(1, "a"), None).unwrap();
    c.update(&cx, &BsonValue::Int64(1), doc(1, "b"), None).unwrap();
    c.delete(&cx, &BsonValue::Int64(1), None).unwrap();

    let insert = sub.receive().unwrap();
    assert_eq!(insert.op, ChangeOp::Insert);
    assert_eq!(insert.doc_id, BsonValue::Int64(1));
    assert!(insert.after.is_some());

    let update = sub.receive().unwrap();
    assert_eq!(update.op, ChangeOp::Update);
    assert!(update.after.is_some());

    let delete = sub.receive().unwrap();
    assert_eq!(delete.op, ChangeOp::Delete);
    assert!(delete.after.is_none());

    assert!(sub.try_receive().is_none());
}

#[test]
fn test_rolled_back_txn_emits_no_events() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    let sub = c.subscribe();

    let mut txn = db.begin(&cx, IsolationLevel::ReadCommitted).unwrap();
    c.insert(&cx, doc(1, "a"), Some(&mut txn)).unwrap();
    db.rollback(&cx, txn);
    assert!(sub.try_receive().is_none());
}

#[test]
fn test_overflow_document_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    let feed = c.subscribe();

    // The binary payload is sized so the whole document encodes to
    // exactly 2 x pageSize + 100 bytes (element headers and the length
    // prefix add 24), which must yield a stub slot plus a two-page
    // overflow chain.
    let page_size = Options::default().page_size;
    let mut big = Document::new();
    big.insert("_id", 1_i64);
    big.insert(
        "blob",
        BsonValue::Binary((0..(2 * page_size + 76)).map(|i| i as u8).collect()),
    );
    c.insert(&cx, big.clone(), None).unwrap();
    let loc = feed.receive().unwrap().location;

    let raw = c.get_raw(&cx, &BsonValue::Int64(1), None).unwrap().unwrap();
    assert_eq!(raw.len(), 2 * page_size + 100);
    let fetched = c.get(&cx, &BsonValue::Int64(1), None).unwrap().unwrap();
    assert_eq!(fetched, big);

    // Fold the pages into the data file and inspect the physical layout:
    // one Data slot flagged HAS_OVERFLOW, chaining through exactly two
    // Overflow pages.
    db.checkpoint(&cx, CheckpointMode::Truncate).unwrap();
    let file = fs::read(dir.path().join("a.db")).unwrap();
    let page_at =
        |id: u32| file[id as usize * page_size..(id as usize + 1) * page_size].to_vec();

    let data_page = SlottedPage::from_bytes(page_at(loc.page_id)).unwrap();
    let slot = data_page.slot(loc.slot).unwrap();
    assert!(slot.has_overflow(), "primary slot must carry HAS_OVERFLOW");

    let stub = overflow::decode_stub(data_page.read(loc.slot).unwrap()).unwrap();
    assert_eq!(stub.total_len as usize, raw.len());
    let mut chain_len = 0;
    let mut overflow_id = stub.head_page;
    while overflow_id != NO_PAGE {
        chain_len += 1;
        let (_, next) = overflow::read_chunk(&page_at(overflow_id)).unwrap();
        overflow_id = next;
    }
    assert_eq!(chain_len, 2, "document must spill to exactly two Overflow pages");

    // Survives an update that shrinks it back below a page.
    c.update(&cx, &BsonValue::Int64(1), doc(1, "small again"), None).unwrap();
    let fetched = c.get(&cx, &BsonValue::Int64(1), None).unwrap().unwrap();
    assert_eq!(fetched.get("name"), Some(&BsonValue::String("small again".into())));

    // And deletion reclaims it.
    c.delete(&cx, &BsonValue::Int64(1), None).unwrap();
    assert_eq!(c.count(&cx).unwrap(), 0);
}

#[test]
fn test_document_too_large_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cx = Cx::new();
    let db = Database::open(
        &cx,
        &dir.path().join("a.db"),
        Options::default().with_max_document_bytes(4096),
    )
    .unwrap();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();

    let mut big = doc(1, "x");
    big.insert("blob", BsonValue::Binary(vec![0; 8192]));
    let err = c.insert(&cx, big, None).unwrap_err();
    assert!(matches!(err, BliteError::DocumentTooLarge { .. }));
    assert_eq!(c.count(&cx).unwrap(), 0);
}

#[test]
fn test_manual_checkpoint_keeps_data_visible() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    for n in 1..=100_i64 {
        c.insert(&cx, doc(n, "row"), None).unwrap();
    }
    assert!(db.wal_len() > 0);

    db.checkpoint(&cx, CheckpointMode::Truncate).unwrap();
    assert_eq!(db.wal_len(), 0);
    assert_eq!(c.count(&cx).unwrap(), 100);
    for n in [1_i64, 50, 100] {
        assert!(c.get(&cx, &BsonValue::Int64(n), None).unwrap().is_some());
    }
    // Idempotent: a second pass finds nothing to do.
    let stats = db.checkpoint(&cx, CheckpointMode::Truncate).unwrap();
    assert_eq!(stats.pages_applied, 0);
    assert_eq!(db.wal_len(), 0);
}

#[test]
fn test_cancelled_checkpoint_leaves_state_usable() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cx = Cx::new();
    let c = db.create_collection(&cx, "c", KeyType::Int64).unwrap();
    c.insert(&cx, doc(1, "a"), None).unwrap();

    let cancelled = Cx::new();
    cancelled.cancel();
    assert!(matches!(
        db.checkpoint(&cancelled, CheckpointMode::Truncate),
        Err(BliteError::Cancelled)
    ));
    // Nothing was lost; a live token still works.
    assert!(c.get(&cx, &BsonValue::Int64(1), None).unwrap().is_some());
    db.checkpoint(&cx, CheckpointMode::Truncate).unwrap();
    assert!(c.get(&cx, &BsonValue::Int64(1), None).unwrap().is_some());
}
