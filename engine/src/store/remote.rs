//! External databases read by pulls.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use sqlx::PgPool;
use sync_config::shared::PullConfig;
use sync_postgres::mirror;
use tokio::sync::Mutex;
use tracing::warn;

use crate::conversions::{pg_row_to_fields, value_to_timestamp};
use crate::error::SyncResult;
use crate::store::{FieldMap, RemoteSource};
use crate::types::Value;

/// Remote rows read from a Postgres database.
#[derive(Debug, Clone)]
pub struct PostgresRemote {
    pool: PgPool,
    table: String,
    modify_time_field: String,
    /// Child table and its column referencing the parent's remote identifier.
    detail: Option<(String, String)>,
}

impl PostgresRemote {
    pub fn new(pool: PgPool, config: &PullConfig) -> Self {
        Self {
            pool,
            table: config.remote_table.clone(),
            modify_time_field: config.modify_time_field.clone(),
            detail: config
                .detail
                .as_ref()
                .map(|detail| (detail.remote_table.clone(), detail.remote_foreign_key.clone())),
        }
    }
}

fn decode_rows(rows: &[sqlx::postgres::PgRow], table: &str) -> Vec<FieldMap> {
    rows.iter()
        .filter_map(|row| match pg_row_to_fields(row) {
            Ok(fields) => Some(fields),
            Err(err) => {
                warn!(table, error = %err, "skipping remote row that cannot be decoded");
                None
            }
        })
        .collect()
}

impl RemoteSource for PostgresRemote {
    async fn fetch_modified(
        &self,
        since: NaiveDateTime,
        limit: usize,
    ) -> SyncResult<Vec<FieldMap>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = mirror::fetch_rows_modified_after(
            &self.pool,
            &self.table,
            &self.modify_time_field,
            since,
            limit,
        )
        .await?;

        Ok(decode_rows(&rows, &self.table))
    }

    async fn fetch_details(&self, parent: &Value) -> SyncResult<Vec<FieldMap>> {
        let Some((table, foreign_key)) = &self.detail else {
            return Ok(Vec::new());
        };
        if parent.is_null() {
            return Ok(Vec::new());
        }

        let rows =
            mirror::fetch_rows_matching(&self.pool, table, foreign_key, &parent.render()).await?;

        Ok(decode_rows(&rows, table))
    }
}

#[derive(Debug, Default)]
struct RemoteInner {
    rows: Vec<FieldMap>,
    /// Child rows keyed by the rendered identifier of their parent.
    details: HashMap<String, Vec<FieldMap>>,
}

/// In-memory external database, for tests and local runs.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    id_field: String,
    modify_time_field: String,
    inner: Arc<Mutex<RemoteInner>>,
}

impl MemoryRemote {
    pub fn new(id_field: impl Into<String>, modify_time_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            modify_time_field: modify_time_field.into(),
            inner: Arc::default(),
        }
    }

    /// Inserts a row, or replaces the row with the same identifier.
    pub async fn put_row(&self, row: FieldMap) {
        let mut inner = self.inner.lock().await;
        let id = row.get(&self.id_field).cloned();

        match inner
            .rows
            .iter()
            .position(|existing| existing.get(&self.id_field).cloned() == id)
        {
            Some(index) => inner.rows[index] = row,
            None => inner.rows.push(row),
        }
    }

    /// Replaces the child rows of the row identified by `parent`.
    pub async fn put_details(&self, parent: &Value, rows: Vec<FieldMap>) {
        self.inner.lock().await.details.insert(parent.render(), rows);
    }
}

impl RemoteSource for MemoryRemote {
    async fn fetch_modified(
        &self,
        since: NaiveDateTime,
        limit: usize,
    ) -> SyncResult<Vec<FieldMap>> {
        let inner = self.inner.lock().await;

        let mut rows: Vec<(NaiveDateTime, FieldMap)> = inner
            .rows
            .iter()
            .filter_map(|row| {
                let modified = row.get(&self.modify_time_field).and_then(value_to_timestamp)?;
                (modified > since).then(|| (modified, row.clone()))
            })
            .collect();
        rows.sort_by_key(|(modified, _)| *modified);

        Ok(rows.into_iter().take(limit).map(|(_, row)| row).collect())
    }

    async fn fetch_details(&self, parent: &Value) -> SyncResult<Vec<FieldMap>> {
        Ok(self
            .inner
            .lock()
            .await
            .details
            .get(&parent.render())
            .cloned()
            .unwrap_or_default())
    }
}
