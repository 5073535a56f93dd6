//! Compressed BSON: standard BSON 1.1 value encodings with the
//! null-terminated field-name strings replaced by 16-bit field ids.
//!
//! The id ↔ name mapping lives in a database-scoped [`FieldSchema`];
//! the codec itself never assigns ids, it only resolves them.

mod codec;
mod schema;
mod value;

pub use codec::{decode, decode_value, encode, encoded_len, scan};
pub use schema::{FieldEntry, FieldSchema, NUMERIC_KEY_RESERVED};
pub use value::{BsonValue, Document};
