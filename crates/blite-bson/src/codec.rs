//! Zero-copy encode/decode/scan over the compressed wire format.
//!
//! ```text
//! doc     := int32 length , element* , 0x00
//! element := type-code(1) , field-id(2, LE) , value
//! ```
//!
//! Value encodings match BSON 1.1 exactly; only the field-name string is
//! replaced by the schema-assigned 16-bit id. Every length prefix is
//! validated against its enclosing bound before use.

use blite_error::{BliteError, Result};
use blite_types::{FieldId, ObjectId};

use crate::schema::{FieldSchema, NUMERIC_KEY_RESERVED};
use crate::value::{BsonValue, Document};

/// Smallest legal document: length prefix plus terminator.
const MIN_DOC_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Exact encoded size of `doc`, so callers that own their buffer can
/// allocate once instead of round-tripping through `BufferTooSmall`.
pub fn encoded_len(doc: &Document, schema: &FieldSchema) -> Result<usize> {
    let mut total = MIN_DOC_LEN;
    for (name, value) in doc.iter() {
        resolve_field(schema, name)?;
        total += 3 + value_len(value, schema)?;
    }
    Ok(total)
}

fn value_len(value: &BsonValue, schema: &FieldSchema) -> Result<usize> {
    Ok(match value {
        BsonValue::Double(_) | BsonValue::DateTime(_) | BsonValue::Timestamp(_)
        | BsonValue::Int64(_) => 8,
        BsonValue::String(s) => 4 + s.len() + 1,
        BsonValue::Document(doc) => encoded_len(doc, schema)?,
        BsonValue::Array(items) => array_len(items, schema)?,
        BsonValue::Binary(bytes) => 4 + 1 + bytes.len(),
        BsonValue::ObjectId(_) => ObjectId::ENCODED_LEN,
        BsonValue::Boolean(_) => 1,
        BsonValue::Null => 0,
        BsonValue::Int32(_) => 4,
        BsonValue::Decimal128(_) => 16,
    })
}

fn array_len(items: &[BsonValue], schema: &FieldSchema) -> Result<usize> {
    if items.len() > usize::from(NUMERIC_KEY_RESERVED) {
        return Err(BliteError::malformed(format!(
            "array of {} elements exceeds the numeric-key range",
            items.len()
        )));
    }
    let mut total = MIN_DOC_LEN;
    for item in items {
        total += 3 + value_len(item, schema)?;
    }
    Ok(total)
}

fn resolve_field(schema: &FieldSchema, name: &str) -> Result<FieldId> {
    schema
        .lookup_name(name)
        .ok_or_else(|| BliteError::UnknownField {
            field: name.to_owned(),
        })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct Writer<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(dst: &'a mut [u8]) -> Self {
        Self { dst, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.dst.len() {
            return Err(BliteError::BufferTooSmall {
                needed: end,
                available: self.dst.len(),
            });
        }
        self.dst[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Backpatch a little-endian i32 written earlier.
    fn patch_i32(&mut self, at: usize, value: i32) {
        self.dst[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Encode `doc` into `dst`, returning the number of bytes written.
///
/// Never allocates. Fails `BufferTooSmall` when `dst` cannot hold the
/// encoding and `UnknownField` for names the schema has not assigned.
pub fn encode(doc: &Document, schema: &FieldSchema, dst: &mut [u8]) -> Result<usize> {
    let mut writer = Writer::new(dst);
    encode_into(doc, schema, &mut writer)?;
    Ok(writer.pos)
}

fn encode_into(doc: &Document, schema: &FieldSchema, writer: &mut Writer<'_>) -> Result<()> {
    let len_at = writer.pos;
    writer.put_i32(0)?;
    for (name, value) in doc.iter() {
        let id = resolve_field(schema, name)?;
        encode_element(id, value, schema, writer)?;
    }
    writer.put_u8(0)?;
    let total = writer.pos - len_at;
    writer.patch_i32(len_at, total as i32);
    Ok(())
}

fn encode_element(
    id: FieldId,
    value: &BsonValue,
    schema: &FieldSchema,
    writer: &mut Writer<'_>,
) -> Result<()> {
    writer.put_u8(value.type_code())?;
    writer.put_u16(id)?;
    encode_value(value, schema, writer)
}

fn encode_value(value: &BsonValue, schema: &FieldSchema, writer: &mut Writer<'_>) -> Result<()> {
    match value {
        BsonValue::Double(v) => writer.put(&v.to_le_bytes()),
        BsonValue::String(s) => {
            writer.put_i32((s.len() + 1) as i32)?;
            writer.put(s.as_bytes())?;
            writer.put_u8(0)
        }
        BsonValue::Document(doc) => encode_into(doc, schema, writer),
        BsonValue::Array(items) => encode_array(items, schema, writer),
        BsonValue::Binary(bytes) => {
            writer.put_i32(bytes.len() as i32)?;
            writer.put_u8(0)?;
            writer.put(bytes)
        }
        BsonValue::ObjectId(oid) => writer.put(oid.as_bytes()),
        BsonValue::Boolean(v) => writer.put_u8(u8::from(*v)),
        BsonValue::DateTime(v) | BsonValue::Int64(v) => writer.put(&v.to_le_bytes()),
        BsonValue::Null => Ok(()),
        BsonValue::Int32(v) => writer.put(&v.to_le_bytes()),
        BsonValue::Timestamp(v) => writer.put(&v.to_le_bytes()),
        BsonValue::Decimal128(bytes) => writer.put(bytes),
    }
}

fn encode_array(
    items: &[BsonValue],
    schema: &FieldSchema,
    writer: &mut Writer<'_>,
) -> Result<()> {
    if items.len() > usize::from(NUMERIC_KEY_RESERVED) {
        return Err(BliteError::malformed(format!(
            "array of {} elements exceeds the numeric-key range",
            items.len()
        )));
    }
    let len_at = writer.pos;
    writer.put_i32(0)?;
    for (index, item) in items.iter().enumerate() {
        // Numeric keys map to the reserved id range: index + 1.
        encode_element(index as FieldId + 1, item, schema, writer)?;
    }
    writer.put_u8(0)?;
    let total = writer.pos - len_at;
    writer.patch_i32(len_at, total as i32);
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(BliteError::malformed(format!(
                "need {len} bytes, {} remain",
                self.remaining()
            )));
        }
        let out = &self.src[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().map_err(|_| {
            BliteError::malformed("short i64")
        })?))
    }

    /// Validated length prefix: at least `min`, at most what remains of the
    /// enclosing bound (counting the prefix itself).
    fn take_len_prefix(&mut self, min: usize) -> Result<usize> {
        let raw = self.take_i32()?;
        let len = usize::try_from(raw)
            .map_err(|_| BliteError::malformed(format!("negative length prefix {raw}")))?;
        if len < min {
            return Err(BliteError::malformed(format!(
                "length prefix {len} below minimum {min}"
            )));
        }
        if len - 4 > self.remaining() {
            return Err(BliteError::malformed(format!(
                "length prefix {len} overruns enclosing bound"
            )));
        }
        Ok(len)
    }
}

/// Decode a full document from `src`. Trailing bytes beyond the document
/// terminator are ignored (pages hand the codec exact slices anyway).
pub fn decode(src: &[u8], schema: &FieldSchema) -> Result<Document> {
    let mut reader = Reader::new(src);
    decode_document(&mut reader, schema)
}

fn decode_document(reader: &mut Reader<'_>, schema: &FieldSchema) -> Result<Document> {
    let len = reader.take_len_prefix(MIN_DOC_LEN)?;
    let end = reader.pos + len - 4;

    let mut doc = Document::new();
    loop {
        if reader.pos >= end {
            return Err(BliteError::malformed("missing document terminator"));
        }
        let code = reader.take_u8()?;
        if code == 0 {
            if reader.pos != end {
                return Err(BliteError::malformed(
                    "document terminator before declared length",
                ));
            }
            return Ok(doc);
        }
        let id = reader.take_u16()?;
        let name = schema
            .lookup_id(id)
            .ok_or_else(|| BliteError::UnknownField {
                field: id.to_string(),
            })?;
        let value = decode_bson_value(code, reader, schema)?;
        doc.insert(name, value);
    }
}

fn decode_bson_value(
    code: u8,
    reader: &mut Reader<'_>,
    schema: &FieldSchema,
) -> Result<BsonValue> {
    Ok(match code {
        0x01 => {
            let bytes = reader.take(8)?;
            BsonValue::Double(f64::from_le_bytes(bytes.try_into().map_err(|_| {
                BliteError::malformed("short double")
            })?))
        }
        0x02 => {
            let len = reader.take_len_prefix_string()?;
            let bytes = reader.take(len)?;
            let (text, terminator) = bytes.split_at(len - 1);
            if terminator != [0] {
                return Err(BliteError::malformed("string missing 0x00 terminator"));
            }
            BsonValue::String(
                std::str::from_utf8(text)
                    .map_err(|_| BliteError::malformed("string is not valid UTF-8"))?
                    .to_owned(),
            )
        }
        0x03 => BsonValue::Document(decode_document(reader, schema)?),
        0x04 => BsonValue::Array(decode_array(reader, schema)?),
        0x05 => {
            let raw = reader.take_i32()?;
            let len = usize::try_from(raw)
                .map_err(|_| BliteError::malformed("negative binary length"))?;
            let subtype = reader.take_u8()?;
            if subtype != 0 {
                return Err(BliteError::malformed(format!(
                    "unsupported binary subtype {subtype:#04x}"
                )));
            }
            BsonValue::Binary(reader.take(len)?.to_vec())
        }
        0x07 => BsonValue::ObjectId(ObjectId::from_slice(reader.take(ObjectId::ENCODED_LEN)?)?),
        0x08 => match reader.take_u8()? {
            0 => BsonValue::Boolean(false),
            1 => BsonValue::Boolean(true),
            other => {
                return Err(BliteError::malformed(format!(
                    "boolean byte must be 0 or 1, got {other}"
                )));
            }
        },
        0x09 => BsonValue::DateTime(reader.take_i64()?),
        0x0A => BsonValue::Null,
        0x10 => BsonValue::Int32(reader.take_i32()?),
        0x11 => {
            let bytes = reader.take(8)?;
            BsonValue::Timestamp(u64::from_le_bytes(bytes.try_into().map_err(|_| {
                BliteError::malformed("short timestamp")
            })?))
        }
        0x12 => BsonValue::Int64(reader.take_i64()?),
        0x13 => {
            let bytes = reader.take(16)?;
            BsonValue::Decimal128(
                bytes
                    .try_into()
                    .map_err(|_| BliteError::malformed("short decimal128"))?,
            )
        }
        other => return Err(BliteError::UnknownTypeCode { code: other }),
    })
}

impl Reader<'_> {
    /// String length prefix counts the bytes plus terminator, minimum 1.
    fn take_len_prefix_string(&mut self) -> Result<usize> {
        let raw = self.take_i32()?;
        let len = usize::try_from(raw)
            .map_err(|_| BliteError::malformed("negative string length"))?;
        if len == 0 {
            return Err(BliteError::malformed("string length must include terminator"));
        }
        if len > self.remaining() {
            return Err(BliteError::malformed("string length overruns bound"));
        }
        Ok(len)
    }
}

fn decode_array(reader: &mut Reader<'_>, schema: &FieldSchema) -> Result<Vec<BsonValue>> {
    let len = reader.take_len_prefix(MIN_DOC_LEN)?;
    let end = reader.pos + len - 4;

    let mut items = Vec::new();
    loop {
        if reader.pos >= end {
            return Err(BliteError::malformed("missing array terminator"));
        }
        let code = reader.take_u8()?;
        if code == 0 {
            if reader.pos != end {
                return Err(BliteError::malformed("array terminator before declared length"));
            }
            return Ok(items);
        }
        let id = reader.take_u16()?;
        let expected = items.len() as u16 + 1;
        if id != expected {
            return Err(BliteError::malformed(format!(
                "array element id {id} out of sequence (expected {expected})"
            )));
        }
        items.push(decode_bson_value(code, reader, schema)?);
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Walk the top-level elements of an encoded document without building a
/// [`Document`]. The visitor receives `(field name, type code, value slice)`
/// and returns `true` to continue.
pub fn scan<F>(src: &[u8], schema: &FieldSchema, mut visitor: F) -> Result<()>
where
    F: FnMut(&str, u8, &[u8]) -> bool,
{
    let mut reader = Reader::new(src);
    let len = reader.take_len_prefix(MIN_DOC_LEN)?;
    let end = reader.pos + len - 4;

    loop {
        if reader.pos >= end {
            return Err(BliteError::malformed("missing document terminator"));
        }
        let code = reader.take_u8()?;
        if code == 0 {
            return Ok(());
        }
        let id = reader.take_u16()?;
        let name = schema
            .lookup_id(id)
            .ok_or_else(|| BliteError::UnknownField {
                field: id.to_string(),
            })?;
        let value_len = skip_len(code, &mut reader)?;
        let slice = reader.take(value_len)?;
        if !visitor(&name, code, slice) {
            return Ok(());
        }
    }
}

/// Decode a single element value from the slice a [`scan`] visitor received.
pub fn decode_value(code: u8, slice: &[u8], schema: &FieldSchema) -> Result<BsonValue> {
    let mut reader = Reader::new(slice);
    let value = decode_bson_value(code, &mut reader, schema)?;
    if reader.remaining() != 0 {
        return Err(BliteError::malformed("trailing bytes after value"));
    }
    Ok(value)
}

/// Width of the value for `code` starting at the reader's position, without
/// consuming it.
fn skip_len(code: u8, reader: &mut Reader<'_>) -> Result<usize> {
    let peek_i32 = |reader: &Reader<'_>| -> Result<usize> {
        if reader.remaining() < 4 {
            return Err(BliteError::malformed("truncated length prefix"));
        }
        let at = reader.pos;
        let raw = i32::from_le_bytes([
            reader.src[at],
            reader.src[at + 1],
            reader.src[at + 2],
            reader.src[at + 3],
        ]);
        usize::try_from(raw).map_err(|_| BliteError::malformed("negative length prefix"))
    };

    let len = match code {
        0x01 | 0x09 | 0x11 | 0x12 => 8,
        0x02 => 4 + peek_i32(reader)?,
        0x03 | 0x04 => peek_i32(reader)?,
        0x05 => 4 + 1 + peek_i32(reader)?,
        0x07 => ObjectId::ENCODED_LEN,
        0x08 => 1,
        0x0A => 0,
        0x10 => 4,
        0x13 => 16,
        other => return Err(BliteError::UnknownTypeCode { code: other }),
    };
    if len > reader.remaining() {
        return Err(BliteError::malformed("element overruns enclosing bound"));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn schema_for(doc: &Document) -> FieldSchema {
        let mut schema = FieldSchema::new();
        schema.intern_document(doc).unwrap();
        schema
    }

    fn round_trip(doc: &Document) -> Document {
        let schema = schema_for(doc);
        let mut buf = vec![0_u8; encoded_len(doc, &schema).unwrap()];
        let written = encode(doc, &schema, &mut buf).unwrap();
        assert_eq!(written, buf.len(), "encoded_len must be exact");
        decode(&buf, &schema).unwrap()
    }

    fn sample_doc() -> Document {
        let mut address = Document::new();
        address.insert("city", "berlin");
        address.insert("zip", 10115_i32);

        let mut doc = Document::new();
        doc.insert("_id", ObjectId::from_bytes([7; 12]));
        doc.insert("name", "alice");
        doc.insert("age", 37_i32);
        doc.insert("balance", 12.5_f64);
        doc.insert("active", true);
        doc.insert("joined", BsonValue::DateTime(1_700_000_000_000));
        doc.insert("notes", BsonValue::Null);
        doc.insert("revision", BsonValue::Timestamp(42));
        doc.insert("big", 9_000_000_000_i64);
        doc.insert("raw", BsonValue::Binary(vec![1, 2, 3, 4]));
        doc.insert("precise", BsonValue::Decimal128([9; 16]));
        doc.insert("address", BsonValue::Document(address));
        doc.insert(
            "tags",
            BsonValue::Array(vec![
                BsonValue::from("red"),
                BsonValue::from(2_i32),
                BsonValue::Null,
            ]),
        );
        doc
    }

    #[test]
    fn test_round_trip_all_types() {
        let doc = sample_doc();
        assert_eq!(round_trip(&doc), doc);
    }

    #[test]
    fn test_empty_document() {
        let doc = Document::new();
        let schema = FieldSchema::new();
        let mut buf = [0_u8; MIN_DOC_LEN];
        let written = encode(&doc, &schema, &mut buf).unwrap();
        assert_eq!(written, MIN_DOC_LEN);
        assert_eq!(buf, [5, 0, 0, 0, 0]);
        assert_eq!(decode(&buf, &schema).unwrap(), doc);
    }

    #[test]
    fn test_buffer_too_small() {
        let doc = sample_doc();
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; 16];
        let err = encode(&doc, &schema, &mut buf).unwrap_err();
        assert!(matches!(err, BliteError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_unknown_field_on_encode() {
        let mut doc = Document::new();
        doc.insert("ghost", 1_i32);
        let schema = FieldSchema::new();
        let mut buf = [0_u8; 64];
        let err = encode(&doc, &schema, &mut buf).unwrap_err();
        assert!(matches!(err, BliteError::UnknownField { .. }));
    }

    #[test]
    fn test_unknown_field_on_decode() {
        let mut doc = Document::new();
        doc.insert("known", 1_i32);
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();
        // Decode against a schema that never saw the field.
        let empty = FieldSchema::new();
        let err = decode(&buf, &empty).unwrap_err();
        assert!(matches!(err, BliteError::UnknownField { .. }));
    }

    #[test]
    fn test_unknown_type_code() {
        let mut doc = Document::new();
        doc.insert("x", 1_i32);
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();
        buf[4] = 0x7F; // corrupt the element type code
        let err = decode(&buf, &schema).unwrap_err();
        assert!(matches!(err, BliteError::UnknownTypeCode { code: 0x7F }));
    }

    #[test]
    fn test_truncated_document() {
        let mut doc = Document::new();
        doc.insert("x", "hello");
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();
        let err = decode(&buf[..buf.len() - 3], &schema).unwrap_err();
        assert!(matches!(err, BliteError::MalformedDocument { .. }));
    }

    #[test]
    fn test_length_prefix_cannot_overrun() {
        let mut doc = Document::new();
        doc.insert("x", "hello");
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();
        // Inflate the inner string length so it points past the document end.
        buf[7] = 0xF0;
        assert!(decode(&buf, &schema).is_err());
    }

    #[test]
    fn test_scan_visits_fields_in_order() {
        let doc = sample_doc();
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();

        let mut names = Vec::new();
        scan(&buf, &schema, |name, _, _| {
            names.push(name.to_owned());
            true
        })
        .unwrap();
        let expected: Vec<String> = doc.iter().map(|(n, _)| n.to_owned()).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_scan_early_exit_and_value_slices() {
        let doc = sample_doc();
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();

        let mut seen = 0;
        scan(&buf, &schema, |name, code, slice| {
            seen += 1;
            if name == "age" {
                let value = decode_value(code, slice, &schema).unwrap();
                assert_eq!(value, BsonValue::Int32(37));
                return false;
            }
            true
        })
        .unwrap();
        assert_eq!(seen, 3, "scan must stop at the visitor's false");
    }

    #[test]
    fn test_array_ids_use_reserved_range() {
        let mut doc = Document::new();
        doc.insert("tags", BsonValue::Array(vec![BsonValue::from(9_i32)]));
        let schema = schema_for(&doc);
        let mut buf = vec![0_u8; encoded_len(&doc, &schema).unwrap()];
        encode(&doc, &schema, &mut buf).unwrap();
        // Outer element header: code 0x04, then the interned "tags" id.
        assert_eq!(buf[4], 0x04);
        // Inner array element header: code 0x10, id 1 (numeric key "0").
        assert_eq!(buf[11], 0x10);
        assert_eq!(u16::from_le_bytes([buf[12], buf[13]]), 1);
    }

    proptest! {
        #[test]
        fn prop_scalar_round_trip(
            a in any::<i32>(),
            b in any::<i64>(),
            c in any::<bool>(),
            s in "[a-z]{0,12}",
        ) {
            let mut doc = Document::new();
            doc.insert("a", a);
            doc.insert("b", b);
            doc.insert("c", c);
            doc.insert("s", s);
            prop_assert_eq!(round_trip(&doc), doc);
        }
    }
}
