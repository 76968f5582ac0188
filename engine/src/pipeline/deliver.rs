//! Create and update delivery with retries and singleton fallback.

use std::slice;

use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::store::DeliveryLedger;
use crate::types::{Payload, RecordId, TransformedRecord};

/// Outcome of delivering a set of creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOutcome {
    pub created: usize,
    pub failed: usize,
}

/// Sends transformed records to the sink and keeps the delivery ledger up to date.
///
/// Creates go out in batches of at most `create_batch_size`. A batch that still fails after
/// every retry is split and each record is created on its own, so one bad record cannot hold
/// back the rest of its batch. Updates are sent one by one.
#[derive(Debug, Clone)]
pub struct Delivery {
    entity: String,
    entry_id: String,
    create_batch_size: usize,
    suppressed_fields: Vec<String>,
    retry: RetryPolicy,
}

impl Delivery {
    pub fn new(
        entity: impl Into<String>,
        entry_id: impl Into<String>,
        create_batch_size: usize,
        suppressed_fields: Vec<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            entity: entity.into(),
            entry_id: entry_id.into(),
            create_batch_size: create_batch_size.max(1),
            suppressed_fields,
            retry,
        }
    }

    /// Creates every record, batching and falling back to singletons as needed.
    pub async fn create_all<K, L>(
        &self,
        sink: &K,
        ledger: &L,
        records: &[TransformedRecord],
    ) -> CreateOutcome
    where
        K: Sink + Sync,
        L: DeliveryLedger + Sync,
    {
        let mut outcome = CreateOutcome::default();

        for batch in records.chunks(self.create_batch_size) {
            let payloads: Vec<Payload> = batch.iter().map(|record| record.fields.clone()).collect();
            let ids: Vec<RecordId> = batch.iter().map(|record| record.source_id).collect();

            let result = self
                .retry
                .run("create_batch", || sink.create(&self.entry_id, &payloads))
                .await;

            match result {
                Ok(()) => {
                    info!(entity = %self.entity, count = batch.len(), "created batch");
                    self.mark_delivered(ledger, &ids).await;
                    outcome.created += batch.len();
                }
                Err(err) if batch.len() > 1 => {
                    warn!(
                        entity = %self.entity,
                        count = batch.len(),
                        error = %err,
                        "batch create failed after retries, falling back to single creates"
                    );

                    for record in batch {
                        if self.create_one(sink, ledger, record).await {
                            outcome.created += 1;
                        } else {
                            outcome.failed += 1;
                        }
                    }
                }
                Err(err) => {
                    self.record_failure(ledger, batch[0].source_id, &err).await;
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    /// Updates an external entity with the update payload of `record`.
    ///
    /// Returns `false` when the update failed after every retry; the failure is recorded in the
    /// ledger and the record stays pending.
    pub async fn update<K, L>(
        &self,
        sink: &K,
        ledger: &L,
        record: &TransformedRecord,
        external_id: &str,
    ) -> bool
    where
        K: Sink + Sync,
        L: DeliveryLedger + Sync,
    {
        let payload = record.for_update(&self.suppressed_fields);

        let result = self
            .retry
            .run("update", || sink.update(&self.entry_id, external_id, &payload))
            .await;

        match result {
            Ok(()) => {
                debug!(
                    entity = %self.entity,
                    record_id = record.source_id,
                    external_id,
                    "updated record"
                );
                self.mark_delivered(ledger, &[record.source_id]).await;
                true
            }
            Err(err) => {
                self.record_failure(ledger, record.source_id, &err).await;
                false
            }
        }
    }

    async fn create_one<K, L>(&self, sink: &K, ledger: &L, record: &TransformedRecord) -> bool
    where
        K: Sink + Sync,
        L: DeliveryLedger + Sync,
    {
        let result = self
            .retry
            .run("create", || {
                sink.create(&self.entry_id, slice::from_ref(&record.fields))
            })
            .await;

        match result {
            Ok(()) => {
                debug!(entity = %self.entity, record_id = record.source_id, "created record");
                self.mark_delivered(ledger, &[record.source_id]).await;
                true
            }
            Err(err) => {
                self.record_failure(ledger, record.source_id, &err).await;
                false
            }
        }
    }

    async fn mark_delivered<L>(&self, ledger: &L, ids: &[RecordId])
    where
        L: DeliveryLedger + Sync,
    {
        let result = self
            .retry
            .run("mark_delivered", || ledger.mark_delivered(&self.entity, ids))
            .await;

        if let Err(err) = result {
            error!(
                entity = %self.entity,
                count = ids.len(),
                error = %err,
                "records were delivered but could not be marked in the ledger"
            );
        }
    }

    /// Records a failed attempt of `id` in the ledger and returns its attempt count, or `None`
    /// when the ledger could not be written.
    pub async fn record_failure<L>(&self, ledger: &L, id: RecordId, err: &SyncError) -> Option<u32>
    where
        L: DeliveryLedger + Sync,
    {
        let message = err.summary();

        match self
            .retry
            .run("record_failure", || {
                ledger.record_failure(&self.entity, id, &message)
            })
            .await
        {
            Ok(attempts) => {
                error!(
                    entity = %self.entity,
                    record_id = id,
                    attempts,
                    error = %message,
                    "record failed after retries"
                );
                Some(attempts)
            }
            Err(ledger_err) => {
                error!(
                    entity = %self.entity,
                    record_id = id,
                    error = %message,
                    ledger_error = %ledger_err,
                    "record failed after retries and the failure could not be recorded"
                );
                None
            }
        }
    }
}
