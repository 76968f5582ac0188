use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::Mutex;

use crate::error::SyncResult;
use crate::store::{
    DeliveryLedger, FieldMap, LocalMirror, MirroredRow, MirrorTarget, PullCursorStore,
    SourceBatch, SourceStore, WatermarkStore, truncate_error,
};
use crate::types::{RawRecord, RecordId, Value, Watermark};

/// Delivery state of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    pub delivered: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Source rows per table, keyed by id.
    tables: HashMap<String, BTreeMap<RecordId, RawRecord>>,
    watermarks: HashMap<String, Watermark>,
    /// Every watermark ever stored per entity, oldest first.
    watermark_history: HashMap<String, Vec<Watermark>>,
    ledger: HashMap<(String, RecordId), LedgerEntry>,
    pull_cursors: HashMap<String, NaiveDateTime>,
}

impl Inner {
    /// Inserts `fields` as a new row of `table` under the next free id.
    fn append_row(&mut self, table: &str, fields: FieldMap) -> RecordId {
        let rows = self.tables.entry(table.to_string()).or_default();
        let id = rows.keys().next_back().map_or(1, |last| last + 1);
        rows.insert(id, RawRecord::from_fields(id, fields));

        id
    }

    fn append_details(
        &mut self,
        target: &MirrorTarget,
        parent_id: RecordId,
        details: &[FieldMap],
    ) {
        let Some(detail) = &target.detail else {
            return;
        };

        for row in details {
            let mut fields = row.clone();
            fields.insert(detail.foreign_key.clone(), Value::Int(parent_id));
            self.append_row(&detail.table, fields);
        }
    }
}

/// In-memory source, watermark store and delivery ledger.
///
/// Used by tests and local runs; nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces source rows of `table`.
    pub async fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = RawRecord>) {
        let mut inner = self.inner.lock().await;
        let table = inner.tables.entry(table.to_string()).or_default();
        for row in rows {
            table.insert(row.id(), row);
        }
    }

    /// Returns the currently stored watermark of `entity`.
    pub async fn watermark(&self, entity: &str) -> Option<Watermark> {
        self.inner.lock().await.watermarks.get(entity).copied()
    }

    pub async fn watermark_history(&self, entity: &str) -> Vec<Watermark> {
        self.inner
            .lock()
            .await
            .watermark_history
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns every row of `table`, ascending by id.
    pub async fn rows(&self, table: &str) -> Vec<RawRecord> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn pull_cursor(&self, name: &str) -> Option<NaiveDateTime> {
        self.inner.lock().await.pull_cursors.get(name).copied()
    }

    pub async fn ledger_entry(&self, entity: &str, id: RecordId) -> Option<LedgerEntry> {
        self.inner
            .lock()
            .await
            .ledger
            .get(&(entity.to_string(), id))
            .cloned()
    }
}

impl SourceStore for MemoryStore {
    async fn fetch_batch(
        &self,
        table: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> SyncResult<SourceBatch> {
        let inner = self.inner.lock().await;
        let Some(rows) = inner.tables.get(table) else {
            return Ok(SourceBatch::default());
        };

        let rows = match after {
            Some(after) => rows
                .range(after.saturating_add(1)..)
                .take(limit)
                .map(|(_, row)| row.clone())
                .collect(),
            None => rows.values().take(limit).cloned().collect(),
        };

        Ok(SourceBatch::new(rows))
    }

    async fn fetch_pending(
        &self,
        entity: &str,
        table: &str,
        max_attempts: u32,
        limit: usize,
    ) -> SyncResult<SourceBatch> {
        let inner = self.inner.lock().await;
        let Some(rows) = inner.tables.get(table) else {
            return Ok(SourceBatch::default());
        };

        let rows = rows
            .values()
            .filter(|row| {
                match inner.ledger.get(&(entity.to_string(), row.id())) {
                    Some(entry) => !entry.delivered && entry.attempts < max_attempts,
                    None => true,
                }
            })
            .take(limit)
            .cloned()
            .collect();

        Ok(SourceBatch::new(rows))
    }

    async fn fetch_children(
        &self,
        table: &str,
        foreign_key: &str,
        parent_ids: &[RecordId],
    ) -> SyncResult<Vec<RawRecord>> {
        let inner = self.inner.lock().await;
        let Some(rows) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };

        let rows = rows
            .values()
            .filter(|row| match row.get(foreign_key) {
                Some(Value::Int(parent)) => parent_ids.contains(parent),
                _ => false,
            })
            .cloned()
            .collect();

        Ok(rows)
    }
}

impl WatermarkStore for MemoryStore {
    async fn get_watermark(&self, entity: &str) -> SyncResult<Option<Watermark>> {
        Ok(self.inner.lock().await.watermarks.get(entity).copied())
    }

    async fn set_watermark(&self, entity: &str, watermark: &Watermark) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let mut stored = *watermark;
        if let Some(current) = inner.watermarks.get(entity) {
            stored.last_id = match (current.last_id, watermark.last_id) {
                (Some(current), Some(new)) => Some(current.max(new)),
                (current, new) => new.or(current),
            };
        }

        inner.watermarks.insert(entity.to_string(), stored);
        inner
            .watermark_history
            .entry(entity.to_string())
            .or_default()
            .push(stored);

        Ok(())
    }
}

impl DeliveryLedger for MemoryStore {
    async fn mark_delivered(&self, entity: &str, ids: &[RecordId]) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            let entry = inner.ledger.entry((entity.to_string(), *id)).or_default();
            entry.delivered = true;
            entry.last_error = None;
        }

        Ok(())
    }

    async fn record_failure(&self, entity: &str, id: RecordId, error: &str) -> SyncResult<u32> {
        let mut inner = self.inner.lock().await;
        let entry = inner.ledger.entry((entity.to_string(), id)).or_default();
        entry.attempts += 1;
        entry.last_error = Some(truncate_error(error).to_string());

        Ok(entry.attempts)
    }
}

impl LocalMirror for MemoryStore {
    async fn find_local(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> SyncResult<Option<RecordId>> {
        let inner = self.inner.lock().await;
        let wanted = value.render();

        let found = inner.tables.get(table).and_then(|rows| {
            rows.values()
                .find(|row| {
                    row.get(column)
                        .is_some_and(|candidate| candidate.render() == wanted)
                })
                .map(RawRecord::id)
        });

        Ok(found)
    }

    async fn insert_mirrored(
        &self,
        target: &MirrorTarget,
        row: &MirroredRow,
    ) -> SyncResult<RecordId> {
        let mut inner = self.inner.lock().await;
        let id = inner.append_row(&target.table, row.fields.clone());
        inner.append_details(target, id, &row.details);

        Ok(id)
    }

    async fn replace_mirrored(
        &self,
        target: &MirrorTarget,
        local_id: RecordId,
        row: &MirroredRow,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner
            .tables
            .get_mut(&target.table)
            .and_then(|rows| rows.get_mut(&local_id))
        {
            let mut fields: FieldMap = existing
                .fields()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();
            fields.extend(row.fields.clone());
            *existing = RawRecord::from_fields(local_id, fields);
        }

        if let Some(detail) = &target.detail
            && let Some(rows) = inner.tables.get_mut(&detail.table)
        {
            rows.retain(|_, row| row.get(&detail.foreign_key) != Some(&Value::Int(local_id)));
        }
        inner.append_details(target, local_id, &row.details);

        if let Some(entity) = &target.ledger_entity {
            inner.ledger.remove(&(entity.clone(), local_id));
        }

        Ok(())
    }
}

impl PullCursorStore for MemoryStore {
    async fn get_pull_cursor(&self, name: &str) -> SyncResult<Option<NaiveDateTime>> {
        Ok(self.inner.lock().await.pull_cursors.get(name).copied())
    }

    async fn set_pull_cursor(&self, name: &str, cursor: NaiveDateTime) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.pull_cursors.entry(name.to_string()).or_insert(cursor);
        *stored = (*stored).max(cursor);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[tokio::test]
    async fn fetch_batch_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store
            .insert_rows("orders", [3, 1, 5, 4, 2].map(RawRecord::new))
            .await;

        let rows = store.fetch_batch("orders", Some(1), 3).await.unwrap().records;

        assert_eq!(rows.iter().map(RawRecord::id).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn stored_last_id_never_decreases() {
        let store = MemoryStore::new();
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let mut watermark = Watermark::initial(today);

        watermark.last_id = Some(10);
        store.set_watermark("orders", &watermark).await.unwrap();
        watermark.last_id = Some(4);
        store.set_watermark("orders", &watermark).await.unwrap();

        assert_eq!(store.watermark("orders").await.unwrap().last_id, Some(10));
    }

    #[tokio::test]
    async fn pending_rows_skip_delivered_and_exhausted() {
        let store = MemoryStore::new();
        store.insert_rows("push", (1..=4).map(RawRecord::new)).await;
        store.mark_delivered("push", &[1]).await.unwrap();
        store.record_failure("push", 2, "timeout").await.unwrap();
        store.record_failure("push", 2, "timeout").await.unwrap();

        let rows = store.fetch_pending("push", "push", 2, 10).await.unwrap().records;

        assert_eq!(rows.iter().map(RawRecord::id).collect::<Vec<_>>(), vec![3, 4]);
        let entry = store.ledger_entry("push", 2).await.unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn replacing_a_mirrored_row_swaps_details_and_clears_ledger() {
        let store = MemoryStore::new();
        let target = MirrorTarget {
            table: "dm_order".to_string(),
            detail: Some(crate::store::MirrorDetail {
                table: "dm_order_detail".to_string(),
                foreign_key: "order_id".to_string(),
            }),
            ledger_entity: Some("dm_orders".to_string()),
        };
        let line = |code: &str| FieldMap::from([("material_code".to_string(), Value::from(code))]);
        let row = MirroredRow {
            fields: FieldMap::from([
                ("source_id".to_string(), Value::Int(70)),
                ("factory".to_string(), Value::from("F1")),
            ]),
            details: vec![line("M-1"), line("M-2")],
        };

        let id = store.insert_mirrored(&target, &row).await.unwrap();
        store.mark_delivered("dm_orders", &[id]).await.unwrap();
        let changed = MirroredRow {
            fields: FieldMap::from([("factory".to_string(), Value::from("F2"))]),
            details: vec![line("M-3")],
        };
        store.replace_mirrored(&target, id, &changed).await.unwrap();

        let rows = store.rows("dm_order").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("source_id").as_deref(), Some("70"));
        assert_eq!(rows[0].text("factory").as_deref(), Some("F2"));
        let details = store.rows("dm_order_detail").await;
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].get("order_id"), Some(&Value::Int(id)));
        assert_eq!(details[0].text("material_code").as_deref(), Some("M-3"));
        assert_eq!(store.ledger_entry("dm_orders", id).await, None);
        assert_eq!(
            store.find_local("dm_order", "source_id", &Value::from("70")).await.unwrap(),
            Some(id)
        );
    }
}
