use chrono::NaiveDateTime;
use serde_json::{Map, Value as JsonValue};
use sqlx::PgPool;
use sync_postgres::mirror::DetailRows;
use sync_postgres::{ledger, mirror, source, state};

use crate::conversions::{fields_to_json, pg_rows_to_batch};
use crate::error::{ErrorKind, SyncResult};
use crate::store::{
    DeliveryLedger, LocalMirror, MirroredRow, MirrorTarget, PullCursorStore, SourceBatch,
    SourceStore, WatermarkStore, truncate_error,
};
use crate::sync_error;
use crate::types::{RawRecord, RecordId, Value, Watermark};

/// Source, watermark store, delivery ledger and pull mirror backed by the source Postgres
/// database.
///
/// Watermarks, pull cursors and the ledger live in the `sync` schema created by the state
/// migrations. The pool is shared by every entity pipeline and pull.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl SourceStore for PostgresStore {
    async fn fetch_batch(
        &self,
        table: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> SyncResult<SourceBatch> {
        let rows = source::fetch_rows_after(&self.pool, table, after, to_limit(limit)).await?;

        Ok(pg_rows_to_batch(&rows))
    }

    async fn fetch_pending(
        &self,
        entity: &str,
        table: &str,
        max_attempts: u32,
        limit: usize,
    ) -> SyncResult<SourceBatch> {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let rows =
            source::fetch_pending_rows(&self.pool, entity, table, max_attempts, to_limit(limit))
                .await?;

        Ok(pg_rows_to_batch(&rows))
    }

    async fn fetch_children(
        &self,
        table: &str,
        foreign_key: &str,
        parent_ids: &[RecordId],
    ) -> SyncResult<Vec<RawRecord>> {
        let rows = source::fetch_child_rows(&self.pool, table, foreign_key, parent_ids).await?;

        // Children are keyed by parent, so undecodable ones are only logged.
        Ok(pg_rows_to_batch(&rows).records)
    }
}

impl WatermarkStore for PostgresStore {
    async fn get_watermark(&self, entity: &str) -> SyncResult<Option<Watermark>> {
        let row = state::get_watermark(&self.pool, entity).await.map_err(|err| {
            sync_error!(
                ErrorKind::WatermarkStoreFailed,
                "Failed to read watermark",
                entity,
                source: err
            )
        })?;

        Ok(row.map(|row| Watermark {
            last_id: row.last_id,
            sync_date: row.sync_date,
            sequence_count: u32::try_from(row.sequence_count).unwrap_or_default(),
        }))
    }

    async fn set_watermark(&self, entity: &str, watermark: &Watermark) -> SyncResult<()> {
        let row = state::WatermarkRow {
            entity: entity.to_string(),
            last_id: watermark.last_id,
            sync_date: watermark.sync_date,
            sequence_count: i32::try_from(watermark.sequence_count).unwrap_or(i32::MAX),
        };

        state::upsert_watermark(&self.pool, &row)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::WatermarkStoreFailed,
                    "Failed to store watermark",
                    entity,
                    source: err
                )
            })?;

        Ok(())
    }
}

impl DeliveryLedger for PostgresStore {
    async fn mark_delivered(&self, entity: &str, ids: &[RecordId]) -> SyncResult<()> {
        ledger::mark_delivered(&self.pool, entity, ids)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::LedgerStoreFailed,
                    "Failed to mark records as delivered",
                    format!("{entity}: {} records", ids.len()),
                    source: err
                )
            })
    }

    async fn record_failure(&self, entity: &str, id: RecordId, error: &str) -> SyncResult<u32> {
        let attempts = ledger::record_failure(&self.pool, entity, id, truncate_error(error))
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::LedgerStoreFailed,
                    "Failed to record delivery failure",
                    format!("{entity}/{id}"),
                    source: err
                )
            })?;

        Ok(u32::try_from(attempts).unwrap_or_default())
    }
}

/// JSON objects of a mirrored row's details.
fn detail_rows(row: &MirroredRow) -> Vec<Map<String, JsonValue>> {
    row.details.iter().map(fields_to_json).collect()
}

impl LocalMirror for PostgresStore {
    async fn find_local(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> SyncResult<Option<RecordId>> {
        let id = mirror::find_local_id(&self.pool, table, column, &value.render()).await?;

        Ok(id)
    }

    async fn insert_mirrored(
        &self,
        target: &MirrorTarget,
        row: &MirroredRow,
    ) -> SyncResult<RecordId> {
        let fields = fields_to_json(&row.fields);
        let details = detail_rows(row);
        let detail = target.detail.as_ref().map(|detail| DetailRows {
            table: &detail.table,
            foreign_key: &detail.foreign_key,
            rows: &details,
        });

        mirror::insert_mirrored(&self.pool, &target.table, &fields, detail)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::MirrorWriteFailed,
                    "Failed to insert mirrored row",
                    target.table.clone(),
                    source: err
                )
            })
    }

    async fn replace_mirrored(
        &self,
        target: &MirrorTarget,
        local_id: RecordId,
        row: &MirroredRow,
    ) -> SyncResult<()> {
        let fields = fields_to_json(&row.fields);
        let details = detail_rows(row);
        let detail = target.detail.as_ref().map(|detail| DetailRows {
            table: &detail.table,
            foreign_key: &detail.foreign_key,
            rows: &details,
        });

        mirror::replace_mirrored(
            &self.pool,
            &target.table,
            local_id,
            &fields,
            detail,
            target.ledger_entity.as_deref(),
        )
        .await
        .map_err(|err| {
            sync_error!(
                ErrorKind::MirrorWriteFailed,
                "Failed to replace mirrored row",
                format!("{}/{local_id}", target.table),
                source: err
            )
        })
    }
}

impl PullCursorStore for PostgresStore {
    async fn get_pull_cursor(&self, name: &str) -> SyncResult<Option<NaiveDateTime>> {
        state::get_pull_cursor(&self.pool, name).await.map_err(|err| {
            sync_error!(
                ErrorKind::WatermarkStoreFailed,
                "Failed to read pull cursor",
                name,
                source: err
            )
        })
    }

    async fn set_pull_cursor(&self, name: &str, cursor: NaiveDateTime) -> SyncResult<()> {
        state::upsert_pull_cursor(&self.pool, name, cursor)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::WatermarkStoreFailed,
                    "Failed to store pull cursor",
                    name,
                    source: err
                )
            })
    }
}
