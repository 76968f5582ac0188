use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value as JsonValue;

use crate::error::SyncResult;
use crate::types::Payload;

/// Equality condition of an external lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// External field id.
    pub field: String,
    pub value: String,
}

impl Condition {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// An entity returned by an external lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalEntity {
    pub id: String,
    pub fields: BTreeMap<String, JsonValue>,
}

impl ExternalEntity {
    /// Returns a field as trimmed text.
    ///
    /// Fields come back either as bare scalars or wrapped as `{value: scalar}`.
    pub fn field_text(&self, field: &str) -> Option<String> {
        let value = match self.fields.get(field)? {
            JsonValue::Object(object) => object.get("value")?,
            other => other,
        };

        match value {
            JsonValue::String(text) => Some(text.trim().to_string()),
            JsonValue::Number(number) => Some(number.to_string()),
            JsonValue::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }

    /// Returns `true` when every condition matches the corresponding field.
    pub fn matches(&self, conditions: &[Condition]) -> bool {
        conditions.iter().all(|condition| {
            self.field_text(&condition.field).as_deref() == Some(condition.value.trim())
        })
    }
}

/// The external system records are synced into.
///
/// A call that returns `Ok` succeeded; rejections and unreadable responses are errors so the
/// retry policy can act on them.
pub trait Sink {
    /// Returns the name of the sink.
    fn name() -> &'static str;

    /// Creates all `records` in the form `entry_id` with a single call.
    fn create(
        &self,
        entry_id: &str,
        records: &[Payload],
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns an entity of `entry_id` matching every condition, if one exists.
    fn query_by_fields(
        &self,
        entry_id: &str,
        conditions: &[Condition],
    ) -> impl Future<Output = SyncResult<Option<ExternalEntity>>> + Send;

    /// Updates the fields present in `fields`; absent fields keep their external value.
    fn update(
        &self,
        entry_id: &str,
        external_id: &str,
        fields: &Payload,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
