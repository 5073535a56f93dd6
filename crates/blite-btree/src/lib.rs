//! B+Tree over Index pages: variable-length keys ordered by unsigned
//! lexicographic comparison, document locations in the leaves, and
//! horizontal sibling links for range walks.

mod node;
mod tree;

pub use node::{MAX_KEY_LEN, Node, NodePayload};
pub use tree::{BTree, EntryIter};
