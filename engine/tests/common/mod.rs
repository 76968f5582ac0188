#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use sync_config::shared::EntityConfig;
use tokio::sync::Mutex;
use sync_engine::bail;
use sync_engine::error::{ErrorKind, SyncResult};
use sync_engine::mapping::FieldMapping;
use sync_engine::pipeline::{PipelineSettings, SyncPipeline};
use sync_engine::retry::RetryPolicy;
use sync_engine::sink::memory::MemorySink;
use sync_engine::sink::{Condition, ExternalEntity, Sink};
use sync_engine::store::memory::MemoryStore;
use sync_engine::store::{DeliveryLedger, SourceBatch, SourceStore, WatermarkStore};
use sync_engine::types::{Payload, RawRecord, RecordId, Watermark};

pub const ORDERS_TABLE: &str = "oms_order";
pub const ORDERS_ENTRY: &str = "orders-entry";

/// External field ids of the orders mapping.
pub const JOB_FIELD: &str = "_widget_job";
pub const STATUS_FIELD: &str = "_widget_status";
pub const REMARK_FIELD: &str = "_widget_remark";
pub const RELEASED_FIELD: &str = "_widget_released";
pub const CODE_FIELD: &str = "_widget_code";

pub fn day(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
}

/// Orders keyed by `job_num`, stamping the release day once the status is `released`.
pub fn orders_entity() -> EntityConfig {
    serde_json::from_value(serde_json::json!({
        "name": "orders",
        "table": ORDERS_TABLE,
        "entry_id": ORDERS_ENTRY,
        "mapping_path": "orders.json",
        "natural_key": ["job_num"],
        "required_fields": ["job_num"],
        "release_stamp": {
            "field_id": RELEASED_FIELD,
            "when": { "field": "status", "equals": "released" }
        },
        "update_suppressed_fields": [RELEASED_FIELD]
    }))
    .unwrap()
}

pub fn orders_mapping() -> FieldMapping {
    FieldMapping {
        main_fields: BTreeMap::from([
            ("job_num".to_string(), JOB_FIELD.to_string()),
            ("status".to_string(), STATUS_FIELD.to_string()),
            ("remark".to_string(), REMARK_FIELD.to_string()),
        ]),
        sub_tables: BTreeMap::new(),
    }
}

pub fn order(id: RecordId, job_num: &str, status: &str) -> RawRecord {
    RawRecord::new(id)
        .with("job_num", job_num)
        .with("status", status)
        .with("remark", format!("order {job_num}"))
}

/// Settings without waits, so failures are retried back to back.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        batch_size: 50,
        create_batch_size: 100,
        retry: RetryPolicy::immediate(3),
        delayed_update_wait: Duration::ZERO,
        max_record_attempts: 3,
    }
}

pub fn create_pipeline<S, K>(entity: EntityConfig, store: S, sink: K) -> SyncPipeline<S, K>
where
    S: SourceStore + WatermarkStore + DeliveryLedger + Send + Sync,
    K: Sink + Send + Sync,
{
    create_pipeline_with(entity, test_settings(), store, sink)
}

pub fn create_pipeline_with<S, K>(
    entity: EntityConfig,
    settings: PipelineSettings,
    store: S,
    sink: K,
) -> SyncPipeline<S, K>
where
    S: SourceStore + WatermarkStore + DeliveryLedger + Send + Sync,
    K: Sink + Send + Sync,
{
    SyncPipeline::new(entity, orders_mapping(), settings, store, sink)
        .unwrap()
        .with_clock(|| day(9))
}

pub fn text_of(entity: &ExternalEntity, field: &str) -> String {
    entity.field_text(field).unwrap_or_default()
}

/// [`MemorySink`] wrapper injecting transport failures.
#[derive(Debug, Clone, Default)]
pub struct FaultySink {
    inner: MemorySink,
    fail_batch_creates: Arc<AtomicBool>,
    fail_queries: Arc<AtomicBool>,
    rejected_lookup_values: Arc<Mutex<BTreeSet<String>>>,
    failed_queries: Arc<AtomicU32>,
    create_calls: Arc<Mutex<Vec<usize>>>,
}

impl FaultySink {
    pub fn wrap(inner: MemorySink) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Makes every create of more than one record fail with a connection error.
    pub fn fail_batch_creates(&self, fail: bool) {
        self.fail_batch_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Makes every lookup conditioned on `value` fail with a client error.
    pub async fn reject_lookups_of(&self, value: &str) {
        self.rejected_lookup_values
            .lock()
            .await
            .insert(value.to_string());
    }

    /// Returns the size of every create call, including the failed ones.
    pub async fn create_calls(&self) -> Vec<usize> {
        self.create_calls.lock().await.clone()
    }

    pub fn failed_queries(&self) -> u32 {
        self.failed_queries.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemorySink {
        &self.inner
    }
}

impl Sink for FaultySink {
    fn name() -> &'static str {
        "faulty"
    }

    async fn create(&self, entry_id: &str, records: &[Payload]) -> SyncResult<()> {
        if records.len() > 1 && self.fail_batch_creates.load(Ordering::SeqCst) {
            self.create_calls.lock().await.push(records.len());
            bail!(
                ErrorKind::SinkConnectionFailed,
                "Connection reset while sending batch",
                format!("{} records", records.len())
            );
        }

        self.create_calls.lock().await.push(records.len());
        self.inner.create(entry_id, records).await
    }

    async fn query_by_fields(
        &self,
        entry_id: &str,
        conditions: &[Condition],
    ) -> SyncResult<Option<ExternalEntity>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            self.failed_queries.fetch_add(1, Ordering::SeqCst);
            bail!(ErrorKind::SinkRequestFailed, "Sink returned an error status", "503");
        }

        let rejected = self.rejected_lookup_values.lock().await;
        if conditions
            .iter()
            .any(|condition| rejected.contains(&condition.value))
        {
            self.failed_queries.fetch_add(1, Ordering::SeqCst);
            bail!(ErrorKind::SinkRequestFailed, "Sink returned an error status", "400");
        }
        drop(rejected);

        self.inner.query_by_fields(entry_id, conditions).await
    }

    async fn update(&self, entry_id: &str, external_id: &str, fields: &Payload) -> SyncResult<()> {
        self.inner.update(entry_id, external_id, fields).await
    }
}

/// [`MemoryStore`] wrapper whose watermark writes can be made to fail and whose rows can be
/// made undecodable.
#[derive(Debug, Clone, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_watermark_writes: Arc<AtomicBool>,
    corrupt_rows: Arc<Mutex<BTreeSet<RecordId>>>,
}

impl FaultyStore {
    pub fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Reports the rows with these ids as malformed on every read.
    pub async fn corrupt_rows(&self, ids: impl IntoIterator<Item = RecordId>) {
        self.corrupt_rows.lock().await.extend(ids);
    }

    async fn corrupt(&self, mut batch: SourceBatch) -> SourceBatch {
        let corrupt = self.corrupt_rows.lock().await;
        let (malformed, records): (Vec<RawRecord>, Vec<RawRecord>) = batch
            .records
            .into_iter()
            .partition(|record| corrupt.contains(&record.id()));
        batch.records = records;
        batch
            .malformed
            .extend(malformed.iter().map(|record| Some(record.id())));

        batch
    }

    pub fn fail_watermark_writes(&self, fail: bool) {
        self.fail_watermark_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl SourceStore for FaultyStore {
    async fn fetch_batch(
        &self,
        table: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> SyncResult<SourceBatch> {
        let batch = self.inner.fetch_batch(table, after, limit).await?;
        Ok(self.corrupt(batch).await)
    }

    async fn fetch_pending(
        &self,
        entity: &str,
        table: &str,
        max_attempts: u32,
        limit: usize,
    ) -> SyncResult<SourceBatch> {
        let batch = self
            .inner
            .fetch_pending(entity, table, max_attempts, limit)
            .await?;
        Ok(self.corrupt(batch).await)
    }

    async fn fetch_children(
        &self,
        table: &str,
        foreign_key: &str,
        parent_ids: &[RecordId],
    ) -> SyncResult<Vec<RawRecord>> {
        self.inner
            .fetch_children(table, foreign_key, parent_ids)
            .await
    }
}

impl WatermarkStore for FaultyStore {
    async fn get_watermark(&self, entity: &str) -> SyncResult<Option<Watermark>> {
        self.inner.get_watermark(entity).await
    }

    async fn set_watermark(&self, entity: &str, watermark: &Watermark) -> SyncResult<()> {
        if self.fail_watermark_writes.load(Ordering::SeqCst) {
            bail!(
                ErrorKind::WatermarkStoreFailed,
                "Failed to store watermark",
                entity.to_string()
            );
        }

        self.inner.set_watermark(entity, watermark).await
    }
}

impl DeliveryLedger for FaultyStore {
    async fn mark_delivered(&self, entity: &str, ids: &[RecordId]) -> SyncResult<()> {
        self.inner.mark_delivered(entity, ids).await
    }

    async fn record_failure(&self, entity: &str, id: RecordId, error: &str) -> SyncResult<u32> {
        self.inner.record_failure(entity, id, error).await
    }
}
