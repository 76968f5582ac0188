use sync_config::shared::ExtractionMode;
use tracing::{debug, error};

use crate::retry::RetryPolicy;
use crate::store::{SourceBatch, SourceStore};
use crate::types::{RawRecord, RecordId};

/// Reads the next batch of an entity from the source.
#[derive(Debug, Clone)]
pub struct Extractor {
    entity: String,
    table: String,
    mode: ExtractionMode,
    batch_size: usize,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(
        entity: impl Into<String>,
        table: impl Into<String>,
        mode: ExtractionMode,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            mode,
            batch_size,
            retry,
        }
    }

    /// Returns at most `batch_size` rows in ascending id order.
    ///
    /// In cursor mode only rows above `last_id` are returned. A source that stays unreachable
    /// after every retry yields an empty batch, which the caller treats as nothing to do.
    pub async fn fetch<S>(&self, store: &S, last_id: Option<RecordId>) -> SourceBatch
    where
        S: SourceStore + Sync,
    {
        let result = match &self.mode {
            ExtractionMode::Cursor => {
                self.retry
                    .run("fetch_batch", || {
                        store.fetch_batch(&self.table, last_id, self.batch_size)
                    })
                    .await
            }
            ExtractionMode::Pending { max_attempts } => {
                self.retry
                    .run("fetch_pending", || {
                        store.fetch_pending(
                            &self.entity,
                            &self.table,
                            *max_attempts,
                            self.batch_size,
                        )
                    })
                    .await
            }
        };

        let mut batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                error!(
                    entity = %self.entity,
                    table = %self.table,
                    error = %err,
                    "extraction failed after retries, skipping this pass"
                );
                return SourceBatch::default();
            }
        };

        if matches!(self.mode, ExtractionMode::Cursor)
            && let Some(last_id) = last_id
        {
            batch.records.retain(|record| record.id() > last_id);
            batch
                .malformed
                .retain(|id| id.is_none_or(|id| id > last_id));
        }
        batch.records.sort_by_key(RawRecord::id);

        debug!(
            entity = %self.entity,
            count = batch.records.len(),
            malformed = batch.malformed.len(),
            "extracted records"
        );

        batch
    }
}
