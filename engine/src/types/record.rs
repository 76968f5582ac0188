use std::collections::BTreeMap;

use crate::types::Value;

/// Source-assigned identifier, strictly increasing per table.
pub type RecordId = i64;

/// Name of the identifier column.
pub const ID_FIELD: &str = "id";

/// A row read from the source.
///
/// The identifier is held as a typed field; every column, `id` included, is also available by
/// name through [`RawRecord::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    id: RecordId,
    fields: BTreeMap<String, Value>,
}

impl RawRecord {
    /// Creates a record holding only its identifier.
    pub fn new(id: RecordId) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(ID_FIELD.to_string(), Value::Int(id));

        Self { id, fields }
    }

    /// Creates a record from decoded columns. The `id` column is overwritten with `id`.
    pub fn from_fields(id: RecordId, mut fields: BTreeMap<String, Value>) -> Self {
        fields.insert(ID_FIELD.to_string(), Value::Int(id));

        Self { id, fields }
    }

    /// Adds a field, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name != ID_FIELD {
            self.fields.insert(name, value.into());
        }
        self
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns the trimmed text of a field when present and non-empty.
    pub fn text(&self, name: &str) -> Option<String> {
        let rendered = self.fields.get(name)?.render();
        if rendered.is_empty() {
            None
        } else {
            Some(rendered)
        }
    }

    /// Iterates fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// A record that survived deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub record: RawRecord,
    /// Set when a lower-id sibling with the same natural key is the create candidate.
    pub delayed_update: bool,
}

impl Candidate {
    pub fn new(record: RawRecord) -> Self {
        Self {
            record,
            delayed_update: false,
        }
    }

    pub fn delayed(record: RawRecord) -> Self {
        Self {
            record,
            delayed_update: true,
        }
    }

    pub fn id(&self) -> RecordId {
        self.record.id()
    }
}
