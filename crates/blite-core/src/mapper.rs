//! The document mapper contract.
//!
//! Collections never assume anything about the shape of a document beyond
//! this trait; generated or hand-written mappers plug in per collection.
//! The default [`BsonMapper`] passes [`Document`] values straight through
//! the codec and keeps the id in the `_id` field.

use blite_bson::{BsonValue, Document, FieldSchema};
use blite_error::Result;

/// Field that carries a document's primary key.
pub const ID_FIELD: &str = "_id";

/// Bytes ↔ document conversion supplied by the collection owner.
pub trait DocumentMapper: Send + Sync {
    /// Exact encoded size, so the caller can allocate its buffer once.
    fn encoded_len(&self, doc: &Document, schema: &FieldSchema) -> Result<usize>;

    /// Encode into a caller-provided buffer; never allocates. May fail
    /// `BufferTooSmall` or `UnknownField`.
    fn encode(&self, doc: &Document, schema: &FieldSchema, dst: &mut [u8]) -> Result<usize>;

    /// Decode a document value; may allocate.
    fn decode(&self, bytes: &[u8], schema: &FieldSchema) -> Result<Document>;

    /// The document's id, if it has one.
    fn get_id(&self, doc: &Document) -> Option<BsonValue>;

    /// Install an id on a document that lacked one.
    fn set_id(&self, doc: &mut Document, id: BsonValue);
}

/// Identity mapper over the C-BSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BsonMapper;

impl DocumentMapper for BsonMapper {
    fn encoded_len(&self, doc: &Document, schema: &FieldSchema) -> Result<usize> {
        blite_bson::encoded_len(doc, schema)
    }

    fn encode(&self, doc: &Document, schema: &FieldSchema, dst: &mut [u8]) -> Result<usize> {
        blite_bson::encode(doc, schema, dst)
    }

    fn decode(&self, bytes: &[u8], schema: &FieldSchema) -> Result<Document> {
        blite_bson::decode(bytes, schema)
    }

    fn get_id(&self, doc: &Document) -> Option<BsonValue> {
        doc.get(ID_FIELD).cloned()
    }

    fn set_id(&self, doc: &mut Document, id: BsonValue) {
        doc.insert(ID_FIELD, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bson_mapper_round_trip() {
        let mut doc = Document::new();
        doc.insert("name", "carol");
        let mut schema = FieldSchema::new();
        schema.intern_document(&doc).unwrap();

        let mapper = BsonMapper;
        let mut buf = vec![0_u8; mapper.encoded_len(&doc, &schema).unwrap()];
        let written = mapper.encode(&doc, &schema, &mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(mapper.decode(&buf, &schema).unwrap(), doc);
    }

    #[test]
    fn test_id_accessors() {
        let mapper = BsonMapper;
        let mut doc = Document::new();
        assert!(mapper.get_id(&doc).is_none());
        mapper.set_id(&mut doc, BsonValue::Int64(9));
        assert_eq!(mapper.get_id(&doc), Some(BsonValue::Int64(9)));
    }
}
