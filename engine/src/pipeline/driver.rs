use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use sync_config::shared::{
    BatchConfig, EntityConfig, ExtractionMode, FoldMode, RetryConfig, ScheduleConfig,
};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::{bail, sync_error};
use crate::mapping::FieldMapping;
use crate::pipeline::dedup::{FingerprintRules, business_key_fold, content_fold};
use crate::pipeline::deliver::Delivery;
use crate::pipeline::extract::Extractor;
use crate::pipeline::reconcile::Reconciler;
use crate::pipeline::summary::PassSummary;
use crate::pipeline::transform::{SequenceCodes, Transformer};
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::store::{DeliveryLedger, SourceStore, WatermarkStore};
use crate::types::{Candidate, Decision, RawRecord, RecordId, TransformedRecord, Value, Watermark};

/// Engine-wide settings shared by every entity pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub create_batch_size: usize,
    pub retry: RetryPolicy,
    /// Wait between the creates of a pass and its delayed updates.
    pub delayed_update_wait: Duration,
    /// Passes a record whose lookup keeps failing may hold back the cursor.
    pub max_record_attempts: u32,
}

impl PipelineSettings {
    pub fn from_config(batch: &BatchConfig, retry: &RetryConfig, schedule: &ScheduleConfig) -> Self {
        Self {
            batch_size: batch.max_size,
            create_batch_size: batch.create_size,
            retry: RetryPolicy::from_config(retry),
            delayed_update_wait: Duration::from_millis(schedule.delayed_update_wait_ms),
            max_record_attempts: retry.max_record_attempts,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(
            &BatchConfig::default(),
            &RetryConfig::default(),
            &ScheduleConfig::default(),
        )
    }
}

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// A transformed record waiting for delivery.
struct Pending {
    record: RawRecord,
    transformed: TransformedRecord,
}

/// Runs sync passes for one entity type.
///
/// A pass extracts the rows after the stored watermark, folds duplicates, transforms the
/// survivors, reconciles them with the sink, delivers creates and updates, and finally advances
/// the watermark. Only one pass of a pipeline runs at a time; different pipelines are
/// independent and may run concurrently on a shared store.
pub struct SyncPipeline<S, K> {
    entity: EntityConfig,
    store: S,
    sink: K,
    extractor: Extractor,
    fingerprint_rules: FingerprintRules,
    transformer: Transformer,
    reconciler: Reconciler,
    delivery: Delivery,
    retry: RetryPolicy,
    delayed_update_wait: Duration,
    max_record_attempts: u32,
    clock: Clock,
    pass_lock: Mutex<()>,
}

impl<S, K> fmt::Debug for SyncPipeline<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("entity", &self.entity.name)
            .field("table", &self.entity.table)
            .field("entry_id", &self.entity.entry_id)
            .finish()
    }
}

impl<S, K> SyncPipeline<S, K>
where
    S: SourceStore + WatermarkStore + DeliveryLedger + Send + Sync,
    K: Sink + Send + Sync,
{
    /// Builds a pipeline. Fails if `mapping` does not cover the entity's key and sub-tables.
    pub fn new(
        entity: EntityConfig,
        mapping: FieldMapping,
        settings: PipelineSettings,
        store: S,
        sink: K,
    ) -> SyncResult<Self> {
        let transformer = Transformer::new(&entity, mapping)?;
        let retry = settings.retry;

        let extractor = Extractor::new(
            entity.name.clone(),
            entity.table.clone(),
            entity.extraction.clone(),
            entity.batch_size.unwrap_or(settings.batch_size),
            retry,
        );
        let reconciler = Reconciler::new(entity.entry_id.clone(), retry);
        let delivery = Delivery::new(
            entity.name.clone(),
            entity.entry_id.clone(),
            entity.create_batch_size.unwrap_or(settings.create_batch_size),
            entity.update_suppressed_fields.clone(),
            retry,
        );

        Ok(Self {
            fingerprint_rules: FingerprintRules::from_entity(&entity),
            entity,
            store,
            sink,
            extractor,
            transformer,
            reconciler,
            delivery,
            retry,
            delayed_update_wait: settings.delayed_update_wait,
            max_record_attempts: settings.max_record_attempts.max(1),
            clock: Arc::new(|| Local::now().date_naive()),
            pass_lock: Mutex::new(()),
        })
    }

    /// Replaces the clock giving the current day.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Replaces the transformer, e.g. to add attribute extractors.
    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn entity(&self) -> &EntityConfig {
        &self.entity
    }

    /// Runs one pass and returns its summary.
    ///
    /// Fails with [`ErrorKind::PassInProgress`] if a pass of this pipeline is already running.
    /// Any other error leaves the stored watermark untouched, so the next pass covers the same
    /// rows again.
    pub async fn run_pass(&self) -> SyncResult<PassSummary> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            bail!(
                ErrorKind::PassInProgress,
                "A pass is already running for this entity",
                self.entity.name
            );
        };

        let span = info_span!("sync_pass", entity = %self.entity.name);
        self.run_pass_inner().instrument(span).await
    }

    async fn run_pass_inner(&self) -> SyncResult<PassSummary> {
        let name = self.entity.name.as_str();
        let today = (self.clock)();
        let mut summary = PassSummary::new(name);

        let stored = self
            .retry
            .run("get_watermark", || self.store.get_watermark(name))
            .await?;
        let watermark = stored.unwrap_or_else(|| Watermark::initial(today)).on(today);

        // Extracting.
        let batch = self.extractor.fetch(&self.store, watermark.last_id).await;
        if batch.is_empty() {
            debug!("no new records");
            summary.watermark = watermark.last_id;
            return Ok(summary);
        }

        summary.total = batch.len();
        let max_id = batch.max_id();
        info!(count = batch.len(), ?max_id, "extracted records");

        summary.malformed = batch.malformed.len();
        let decode_error = sync_error!(ErrorKind::ConversionError, "Source row could not be decoded");
        for id in batch.malformed.iter().flatten() {
            self.delivery
                .record_failure(&self.store, *id, &decode_error)
                .await;
        }

        // Deduping.
        let (valid, invalid): (Vec<RawRecord>, Vec<RawRecord>) = batch
            .records
            .into_iter()
            .partition(|record| self.transformer.is_valid(record));
        for record in &invalid {
            warn!(record_id = record.id(), "record misses a required field, skipping");
        }
        summary.invalid = invalid.len();
        summary.valid = valid.len();

        let folded = content_fold(valid, &self.fingerprint_rules);
        summary.duplicates = summary.valid - folded.len();

        let candidates: Vec<Candidate> = match self.entity.fold {
            FoldMode::Content => folded.into_iter().map(Candidate::new).collect(),
            FoldMode::ContentAndBusinessKey => {
                business_key_fold(folded, &self.entity.natural_key)
            }
        };

        // Transforming.
        let mut children = self.fetch_children(&candidates).await?;
        let mut transformed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let record_children = children.remove(&candidate.id()).unwrap_or_default();
            match self.transformer.transform(&candidate.record, &record_children, today) {
                Ok(result) => transformed.push((candidate, result)),
                Err(err) => {
                    warn!(record_id = candidate.id(), error = %err, "transform failed, skipping");
                    summary.transform_failed += 1;
                }
            }
        }

        // Reconciling.
        let mut codes = self
            .entity
            .sequence_code
            .clone()
            .map(|config| SequenceCodes::new(config, watermark.sequence_count));
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut delayed = Vec::new();
        let mut unreconciled: Option<RecordId> = None;

        for (candidate, mut result) in transformed {
            let pending_record = candidate.record;
            if candidate.delayed_update {
                delayed.push(Pending {
                    record: pending_record,
                    transformed: result,
                });
                continue;
            }

            match self
                .reconciler
                .reconcile(&self.sink, result.natural_key.as_ref())
                .await
            {
                Ok(Decision::Create) => {
                    if let Some(codes) = codes.as_mut() {
                        codes.assign(&pending_record, &mut result.fields);
                    }
                    creates.push(result);
                }
                Ok(Decision::Update(external_id)) => {
                    summary.existing += 1;
                    updates.push((result, external_id));
                }
                Err(err) => {
                    warn!(
                        record_id = pending_record.id(),
                        error = %err,
                        "reconciliation failed, leaving record out of this pass"
                    );
                    summary.reconcile_failed += 1;
                    if self.holds_cursor(pending_record.id(), &err).await {
                        unreconciled = lowest_of(unreconciled, Some(pending_record.id()));
                    }
                }
            }
        }

        // Delivering.
        if !creates.is_empty() {
            let outcome = self
                .delivery
                .create_all(&self.sink, &self.store, &creates)
                .await;
            summary.created += outcome.created;
            summary.failed += outcome.failed;
        }

        for (record, external_id) in &updates {
            if self
                .delivery
                .update(&self.sink, &self.store, record, external_id)
                .await
            {
                summary.updated += 1;
            } else {
                summary.failed += 1;
            }
        }

        if !delayed.is_empty() {
            let lowest = self.deliver_delayed(delayed, &mut summary).await;
            unreconciled = lowest_of(unreconciled, lowest);
        }

        // Advancing watermark. Rows whose lookup failed and that still have attempts left are
        // read again by the next pass, so the cursor stops right before the lowest of them.
        let observed = match self.entity.extraction {
            ExtractionMode::Cursor => match unreconciled {
                Some(id) => max_id.map(|max_id| max_id.min(id - 1)),
                None => max_id,
            },
            ExtractionMode::Pending { .. } => None,
        };
        let sequence_count = codes
            .as_ref()
            .map(SequenceCodes::count)
            .unwrap_or(watermark.sequence_count);
        summary.sequence_codes_assigned = codes.as_ref().map(SequenceCodes::assigned).unwrap_or(0);

        let advanced = watermark.advanced(observed, sequence_count);
        if let Err(err) = self
            .retry
            .run("set_watermark", || self.store.set_watermark(name, &advanced))
            .await
        {
            error!(
                error = %err,
                last_id = ?advanced.last_id,
                "failed to store watermark, the next pass will repeat this range"
            );
            summary.watermark = watermark.last_id;
            summary.log();
            return Err(err);
        }

        summary.watermark = advanced.last_id;
        if summary.lost() > 0 {
            warn!(lost = summary.lost(), "some records were not delivered in this pass");
        }
        summary.log();

        Ok(summary)
    }

    /// Reads the sub-table rows of every candidate, grouped by parent id and sub-table name.
    async fn fetch_children(
        &self,
        candidates: &[Candidate],
    ) -> SyncResult<HashMap<RecordId, BTreeMap<String, Vec<RawRecord>>>> {
        let mut children: HashMap<RecordId, BTreeMap<String, Vec<RawRecord>>> = HashMap::new();
        if self.entity.sub_tables.is_empty() || candidates.is_empty() {
            return Ok(children);
        }

        let parent_ids: Vec<RecordId> = candidates.iter().map(Candidate::id).collect();
        for sub_table in &self.entity.sub_tables {
            let rows = self
                .retry
                .run("fetch_children", || {
                    self.store
                        .fetch_children(&sub_table.table, &sub_table.foreign_key, &parent_ids)
                })
                .await?;

            for row in rows {
                let Some(Value::Int(parent_id)) = row.get(&sub_table.foreign_key) else {
                    continue;
                };
                children
                    .entry(*parent_id)
                    .or_default()
                    .entry(sub_table.name.clone())
                    .or_default()
                    .push(row);
            }
        }

        Ok(children)
    }

    /// Updates the external entities of delayed-update candidates, in ascending id order.
    ///
    /// A delayed update whose entity cannot be found is counted as failed and never created.
    /// Returns the lowest id whose lookup failed.
    async fn deliver_delayed(
        &self,
        mut delayed: Vec<Pending>,
        summary: &mut PassSummary,
    ) -> Option<RecordId> {
        let mut unreconciled = None;
        delayed.sort_by_key(|pending| pending.record.id());

        if !self.delayed_update_wait.is_zero() {
            debug!(
                wait_ms = self.delayed_update_wait.as_millis() as u64,
                count = delayed.len(),
                "waiting before delayed updates"
            );
            sleep(self.delayed_update_wait).await;
        }

        for pending in delayed {
            let record_id = pending.record.id();
            let decision = self
                .reconciler
                .reconcile(&self.sink, pending.transformed.natural_key.as_ref())
                .await;

            match decision {
                Ok(Decision::Update(external_id)) => {
                    summary.existing += 1;
                    if self
                        .delivery
                        .update(&self.sink, &self.store, &pending.transformed, &external_id)
                        .await
                    {
                        summary.updated += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Ok(Decision::Create) => {
                    warn!(record_id, "delayed update found no external entity, skipping");
                    summary.failed += 1;
                }
                Err(err) => {
                    warn!(record_id, error = %err, "reconciliation of delayed update failed");
                    summary.reconcile_failed += 1;
                    if self.holds_cursor(record_id, &err).await {
                        unreconciled = lowest_of(unreconciled, Some(record_id));
                    }
                }
            }
        }

        unreconciled
    }

    /// Records a failed lookup and returns whether the record may hold back the cursor.
    ///
    /// A record keeps the cursor below it until its attempts reach `max_record_attempts`; from
    /// then on it is lost and the cursor moves past it. An unknown attempt count holds.
    async fn holds_cursor(&self, record_id: RecordId, err: &SyncError) -> bool {
        let Some(attempts) = self
            .delivery
            .record_failure(&self.store, record_id, err)
            .await
        else {
            return true;
        };

        if attempts >= self.max_record_attempts {
            error!(
                record_id,
                attempts,
                max_attempts = self.max_record_attempts,
                "lookup kept failing, giving up on record"
            );
            return false;
        }

        true
    }
}

fn lowest_of(a: Option<RecordId>, b: Option<RecordId>) -> Option<RecordId> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
