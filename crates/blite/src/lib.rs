//! BLite: an embedded, ACID, document-oriented database engine that
//! persists schema-typed documents to a single file.
//!
//! ```no_run
//! use blite::{Cx, Database, Document, KeyType, Options};
//!
//! fn main() -> blite::Result<()> {
//!     let cx = Cx::new();
//!     let db = Database::open(&cx, "app.db".as_ref(), Options::default())?;
//!     let users = db.create_collection(&cx, "users", KeyType::Int64)?;
//!
//!     let mut alice = Document::new();
//!     alice.insert("_id", 1_i64);
//!     alice.insert("name", "Alice");
//!     users.insert(&cx, alice, None)?;
//!
//!     let found = users.get(&cx, &1_i64.into(), None)?;
//!     assert!(found.is_some());
//!     db.close(&cx)
//! }
//! ```

pub use blite_bson::{BsonValue, Document, FieldSchema};
pub use blite_core::{
    BsonMapper, Change, CheckpointMode, CheckpointStats, Collection, Database, DocumentMapper,
    KeyType, SecondaryIndex, Subscription,
};
pub use blite_error::{BliteError, Result};
pub use blite_txn::{ChangeOp, IsolationLevel, Transaction, TxnState};
pub use blite_types::{Cx, DocumentLocation, IndexKey, ObjectId, Options, PageId, TxnId};
