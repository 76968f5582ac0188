use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::RecordId;

/// Value of an external field: a scalar rendered as text, or the rows of a sub-form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Rows(Vec<Payload>),
}

/// The `{value: ...}` envelope the form API expects around every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wrapped {
    pub value: FieldValue,
}

impl Wrapped {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: FieldValue::Text(value.into()),
        }
    }

    pub fn rows(rows: Vec<Payload>) -> Self {
        Self {
            value: FieldValue::Rows(rows),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            FieldValue::Text(text) => Some(text),
            FieldValue::Rows(_) => None,
        }
    }
}

/// External field id to wrapped value.
pub type Payload = BTreeMap<String, Wrapped>;

/// One component of a natural key, addressed by its external field id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    pub field_id: String,
    pub value: String,
}

/// Natural key of a record expressed in external field ids, in configured order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKey(pub Vec<KeyPart>);

impl NaturalKey {
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

/// A record projected into the external field format.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub source_id: RecordId,
    pub fields: Payload,
    /// `None` when the entity type has no natural key; such records are always created.
    pub natural_key: Option<NaturalKey>,
}

impl TransformedRecord {
    /// Returns the payload sent on update, without the suppressed fields.
    pub fn for_update(&self, suppressed: &[String]) -> Payload {
        self.fields
            .iter()
            .filter(|(field_id, _)| !suppressed.iter().any(|s| s == *field_id))
            .map(|(field_id, value)| (field_id.clone(), value.clone()))
            .collect()
    }
}

/// Outcome of reconciling one record against the external system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Create,
    /// Update of the external entity with this id.
    Update(String),
}
