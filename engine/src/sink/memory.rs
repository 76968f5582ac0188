use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::sink::{Condition, ExternalEntity, Sink};
use crate::types::{FieldValue, Payload};

/// A recorded update call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCall {
    pub entry_id: String,
    pub external_id: String,
    pub fields: Payload,
}

#[derive(Debug, Default)]
struct Inner {
    /// Entities per form, in creation order.
    entities: BTreeMap<String, Vec<ExternalEntity>>,
    next_id: u64,
    /// Number of records of every create call, accepted or not.
    create_calls: Vec<usize>,
    update_calls: Vec<UpdateCall>,
    query_calls: usize,
    /// Records carrying one of these field values are rejected, like a server-side validation.
    rejections: Vec<(String, String)>,
}

impl Inner {
    fn is_rejected(&self, payload: &Payload) -> bool {
        self.rejections.iter().any(|(field, value)| {
            payload.get(field).and_then(|wrapped| wrapped.as_text()) == Some(value.as_str())
        })
    }
}

/// In-memory form store implementing [`Sink`].
///
/// Creates are all-or-nothing per call, as with the real API. Entities get ids `mem-1`,
/// `mem-2`, and so on.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every create or update containing a record whose `field` equals `value`.
    pub async fn reject_when(&self, field: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .await
            .rejections
            .push((field.into(), value.into()));
    }

    /// Seeds an existing external entity and returns its id.
    pub async fn insert_entity(&self, entry_id: &str, fields: Payload) -> String {
        let mut inner = self.inner.lock().await;
        insert(&mut inner, entry_id, &fields)
    }

    pub async fn entities(&self, entry_id: &str) -> Vec<ExternalEntity> {
        self.inner
            .lock()
            .await
            .entities
            .get(entry_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the batch size of every create call made so far.
    pub async fn create_calls(&self) -> Vec<usize> {
        self.inner.lock().await.create_calls.clone()
    }

    pub async fn update_calls(&self) -> Vec<UpdateCall> {
        self.inner.lock().await.update_calls.clone()
    }

    pub async fn query_calls(&self) -> usize {
        self.inner.lock().await.query_calls
    }

    pub async fn clear_calls(&self) {
        let mut inner = self.inner.lock().await;
        inner.create_calls.clear();
        inner.update_calls.clear();
        inner.query_calls = 0;
    }
}

fn to_json(fields: &Payload) -> BTreeMap<String, JsonValue> {
    fields
        .iter()
        .map(|(field, wrapped)| {
            let value = match &wrapped.value {
                FieldValue::Text(text) => JsonValue::String(text.clone()),
                FieldValue::Rows(_) => serde_json::to_value(&wrapped.value).unwrap_or_default(),
            };
            (field.clone(), value)
        })
        .collect()
}

fn insert(inner: &mut Inner, entry_id: &str, fields: &Payload) -> String {
    inner.next_id += 1;
    let id = format!("mem-{}", inner.next_id);

    inner
        .entities
        .entry(entry_id.to_string())
        .or_default()
        .push(ExternalEntity {
            id: id.clone(),
            fields: to_json(fields),
        });

    id
}

impl Sink for MemorySink {
    fn name() -> &'static str {
        "memory"
    }

    async fn create(&self, entry_id: &str, records: &[Payload]) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.create_calls.push(records.len());

        if records.iter().any(|record| inner.is_rejected(record)) {
            bail!(
                ErrorKind::SinkRejected,
                "Sink rejected the create request",
                format!("{} records", records.len())
            );
        }

        for record in records {
            insert(&mut inner, entry_id, record);
        }

        info!(entry_id, count = records.len(), "created records in memory sink");

        Ok(())
    }

    async fn query_by_fields(
        &self,
        entry_id: &str,
        conditions: &[Condition],
    ) -> SyncResult<Option<ExternalEntity>> {
        let mut inner = self.inner.lock().await;
        inner.query_calls += 1;

        Ok(inner
            .entities
            .get(entry_id)
            .and_then(|entities| entities.iter().find(|entity| entity.matches(conditions)))
            .cloned())
    }

    async fn update(&self, entry_id: &str, external_id: &str, fields: &Payload) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.update_calls.push(UpdateCall {
            entry_id: entry_id.to_string(),
            external_id: external_id.to_string(),
            fields: fields.clone(),
        });

        if inner.is_rejected(fields) {
            bail!(
                ErrorKind::SinkRejected,
                "Sink rejected the update request",
                external_id
            );
        }

        let Some(entity) = inner
            .entities
            .get_mut(entry_id)
            .and_then(|entities| entities.iter_mut().find(|entity| entity.id == external_id))
        else {
            bail!(
                ErrorKind::SinkRejected,
                "Sink has no entity with this id",
                external_id
            );
        };

        entity.fields.extend(to_json(fields));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Wrapped;

    fn payload(job: &str) -> Payload {
        Payload::from([("job".to_string(), Wrapped::text(job))])
    }

    #[tokio::test]
    async fn creates_are_all_or_nothing() {
        let sink = MemorySink::new();
        sink.reject_when("job", "BAD").await;

        let result = sink.create("orders", &[payload("J-1"), payload("BAD")]).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::SinkRejected);
        assert!(sink.entities("orders").await.is_empty());
        assert_eq!(sink.create_calls().await, vec![2]);
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let sink = MemorySink::new();
        let id = sink.insert_entity("orders", payload("J-1")).await;

        let mut fields = Payload::new();
        fields.insert("status".to_string(), Wrapped::text("released"));
        sink.update("orders", &id, &fields).await.unwrap();

        let found = sink
            .query_by_fields("orders", &[Condition::new("job", "J-1")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.field_text("status").as_deref(), Some("released"));
    }
}
