//! Engine core: the collection manager, field-name dictionary
//! persistence, the checkpoint manager, post-commit change fan-out, and
//! the `Database` facade that wires them together.

mod catalog;
mod checkpoint;
mod collection;
mod db;
mod dictionary;
mod mapper;
mod watch;

pub use catalog::{Catalog, CollectionMeta, KeyType, SecondaryIndex};
pub use checkpoint::{CheckpointManager, CheckpointMode, CheckpointStats, Checkpointer};
pub use collection::Collection;
pub use db::Database;
pub use dictionary::Dictionary;
pub use mapper::{BsonMapper, DocumentMapper};
pub use watch::{Change, ChangeDispatcher, Subscription};
