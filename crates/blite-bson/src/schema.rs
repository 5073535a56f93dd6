//! Database-scoped bidirectional map between field names and 16-bit ids.
//!
//! Ids are assigned on first use and never reused. Ids `1..=NUMERIC_KEY_RESERVED`
//! are implicitly bound to the numeric keys `"0"`, `"1"`, … used by array
//! elements; they are never persisted. Interned user fields start directly
//! above the reserved range.

use blite_error::{BliteError, Result};
use blite_types::FieldId;
use hashbrown::HashMap;
use tracing::debug;

use crate::value::{BsonValue, Document};

/// Number of field ids implicitly reserved for numeric keys. Arrays longer
/// than this cannot be encoded.
pub const NUMERIC_KEY_RESERVED: u16 = 4096;

/// First id handed to an interned user field.
const FIRST_USER_ID: FieldId = NUMERIC_KEY_RESERVED + 1;

/// One persisted schema entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub id: FieldId,
    pub name: String,
    /// BSON type code observed when the field was first interned.
    pub bson_type: u8,
}

/// The field-name schema: `name ↔ id` for one database.
#[derive(Debug, Default)]
pub struct FieldSchema {
    by_name: HashMap<String, FieldId>,
    by_id: HashMap<FieldId, FieldEntry>,
    next_id: FieldId,
    /// Bumped on every new assignment; lets the owner detect unsaved entries.
    generation: u64,
}

impl FieldSchema {
    /// Empty schema with no user fields interned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: FIRST_USER_ID,
            generation: 0,
        }
    }

    /// Monotonic counter of schema mutations.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of interned user fields (excludes the reserved numeric range).
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Resolve a name to its id without assigning. Numeric keys inside the
    /// reserved range resolve implicitly.
    #[must_use]
    pub fn lookup_name(&self, name: &str) -> Option<FieldId> {
        if let Some(id) = numeric_key_id(name) {
            return Some(id);
        }
        self.by_name.get(name).copied()
    }

    /// Resolve an id back to its name. Reserved ids yield their decimal form.
    #[must_use]
    pub fn lookup_id(&self, id: FieldId) -> Option<String> {
        if id == 0 {
            return None;
        }
        if id <= NUMERIC_KEY_RESERVED {
            return Some((id - 1).to_string());
        }
        self.by_id.get(&id).map(|entry| entry.name.clone())
    }

    /// Resolve an id to a borrowed name when it is an interned user field.
    #[must_use]
    pub fn user_field_name(&self, id: FieldId) -> Option<&str> {
        self.by_id.get(&id).map(|entry| entry.name.as_str())
    }

    /// Assign an id to `name` on first use; subsequent calls return the
    /// existing id. Numeric keys resolve to the reserved range and are
    /// never assigned storage.
    pub fn intern(&mut self, name: &str, bson_type: u8) -> Result<FieldId> {
        if let Some(id) = numeric_key_id(name) {
            return Ok(id);
        }
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }
        if self.next_id == FieldId::MAX {
            return Err(BliteError::internal("field-name schema exhausted"));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.generation += 1;
        self.by_name.insert(name.to_owned(), id);
        self.by_id.insert(
            id,
            FieldEntry {
                id,
                name: name.to_owned(),
                bson_type,
            },
        );
        debug!(field = name, id, "interned field name");
        Ok(id)
    }

    /// Intern every field name reachable from `doc`, recursively.
    pub fn intern_document(&mut self, doc: &Document) -> Result<()> {
        for (name, value) in doc.iter() {
            self.intern(name, value.type_code())?;
            self.intern_value(value)?;
        }
        Ok(())
    }

    fn intern_value(&mut self, value: &BsonValue) -> Result<()> {
        match value {
            BsonValue::Document(doc) => self.intern_document(doc),
            BsonValue::Array(items) => {
                if items.len() > usize::from(NUMERIC_KEY_RESERVED) {
                    return Err(BliteError::malformed(format!(
                        "array of {} elements exceeds the numeric-key range",
                        items.len()
                    )));
                }
                for item in items {
                    self.intern_value(item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Restore one persisted entry at open time.
    pub fn load_entry(&mut self, entry: FieldEntry) -> Result<()> {
        if entry.id < FIRST_USER_ID {
            return Err(BliteError::invalid_format(format!(
                "dictionary entry {} collides with the reserved numeric range",
                entry.id
            )));
        }
        if self.by_id.contains_key(&entry.id) {
            return Err(BliteError::invalid_format(format!(
                "duplicate dictionary entry for id {}",
                entry.id
            )));
        }
        self.next_id = self.next_id.max(entry.id + 1);
        self.by_name.insert(entry.name.clone(), entry.id);
        self.by_id.insert(entry.id, entry);
        Ok(())
    }

    /// All persisted entries in id order (reserved ids excluded).
    #[must_use]
    pub fn entries(&self) -> Vec<FieldEntry> {
        let mut entries: Vec<FieldEntry> = self.by_id.values().cloned().collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }
}

/// Implicit id for numeric keys `"0"..="4095"`: the value plus one.
/// Returns `None` for anything with leading zeros or out of range, so
/// `"007"` is an ordinary (internable) field name.
fn numeric_key_id(name: &str) -> Option<FieldId> {
    if name.is_empty() || name.len() > 4 {
        return None;
    }
    if name.len() > 1 && name.starts_with('0') {
        return None;
    }
    let value: u16 = name.parse().ok()?;
    (value < NUMERIC_KEY_RESERVED).then_some(value + 1)
}
