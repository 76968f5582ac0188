use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{Days, Local, NaiveDateTime};
use sync_config::shared::PullConfig;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bail;
use crate::conversions::value_to_timestamp;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::pipeline::PipelineSettings;
use crate::pull::PullSummary;
use crate::retry::RetryPolicy;
use crate::store::{
    FieldMap, LocalMirror, MirrorDetail, MirrorTarget, MirroredRow, PullCursorStore,
    RemoteSource,
};
use crate::types::{ID_FIELD, RecordId, Value};

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// What happened to one remote row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mirrored {
    Inserted(RecordId),
    Updated(RecordId),
}

/// Runs pull passes for one external table.
///
/// A pass reads the remote rows modified after the stored cursor, oldest first. Each row is
/// matched to a local row by source id, then by order number, and is inserted or replaces the
/// local row along with its details. The cursor then moves to the newest row mirrored. A row
/// that fails holds the cursor below it until it has failed `max_record_attempts` passes in a
/// row; its failures are counted in memory only.
pub struct PullPipeline<R, M> {
    config: PullConfig,
    target: MirrorTarget,
    remote: R,
    mirror: M,
    retry: RetryPolicy,
    max_row_attempts: u32,
    /// Consecutive failed passes per rendered source id.
    failures: Mutex<HashMap<String, u32>>,
    clock: Clock,
    pass_lock: Mutex<()>,
}

impl<R, M> fmt::Debug for PullPipeline<R, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullPipeline")
            .field("pull", &self.config.name)
            .field("remote_table", &self.config.remote_table)
            .field("local_table", &self.config.local_table)
            .finish()
    }
}

impl<R, M> PullPipeline<R, M>
where
    R: RemoteSource + Send + Sync,
    M: LocalMirror + PullCursorStore + Send + Sync,
{
    pub fn new(config: PullConfig, settings: &PipelineSettings, remote: R, mirror: M) -> Self {
        let target = MirrorTarget {
            table: config.local_table.clone(),
            detail: config.detail.as_ref().map(|detail| MirrorDetail {
                table: detail.local_table.clone(),
                foreign_key: detail.local_foreign_key.clone(),
            }),
            ledger_entity: config.push_entity.clone(),
        };

        Self {
            config,
            target,
            remote,
            mirror,
            retry: settings.retry,
            max_row_attempts: settings.max_record_attempts.max(1),
            failures: Mutex::new(HashMap::new()),
            clock: Arc::new(|| Local::now().naive_local()),
            pass_lock: Mutex::new(()),
        }
    }

    /// Replaces the clock giving the current time.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Runs one pass and returns its summary.
    ///
    /// Fails with [`ErrorKind::PassInProgress`] if a pass of this pull is already running.
    /// Reading the cursor or the remote batch and storing the cursor fail the pass; a failure
    /// on a single row only counts it as failed.
    pub async fn run_pass(&self) -> SyncResult<PullSummary> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            bail!(
                ErrorKind::PassInProgress,
                "A pass is already running for this pull",
                self.config.name
            );
        };

        let span = info_span!("pull_pass", pull = %self.config.name);
        self.run_pass_inner().instrument(span).await
    }

    async fn run_pass_inner(&self) -> SyncResult<PullSummary> {
        let name = self.config.name.as_str();
        let mut summary = PullSummary::new(name);

        let stored = self
            .retry
            .run("get_pull_cursor", || self.mirror.get_pull_cursor(name))
            .await?;
        let cursor = stored.unwrap_or_else(|| self.initial_cursor());

        let rows = self
            .retry
            .run("fetch_modified", || {
                self.remote.fetch_modified(cursor, self.config.batch_size)
            })
            .await?;
        summary.cursor = Some(cursor);
        if rows.is_empty() {
            debug!("no modified remote rows");
            return Ok(summary);
        }

        summary.total = rows.len();
        info!(count = rows.len(), %cursor, "fetched modified remote rows");

        // Modify times the cursor may move to, and the oldest one it must stay below.
        let mut passed = Vec::with_capacity(rows.len());
        let mut held: Option<NaiveDateTime> = None;

        for row in &rows {
            let Some(modified) = row
                .get(&self.config.modify_time_field)
                .and_then(value_to_timestamp)
            else {
                warn!(
                    field = %self.config.modify_time_field,
                    "remote row has no readable modify time, skipping"
                );
                summary.failed += 1;
                continue;
            };

            let source_key = self.source_id(row).render();
            match self.mirror_row(row).await {
                Ok(Mirrored::Inserted(local_id)) => {
                    debug!(source_id = %source_key, local_id, "inserted mirrored row");
                    summary.inserted += 1;
                }
                Ok(Mirrored::Updated(local_id)) => {
                    debug!(source_id = %source_key, local_id, "updated mirrored row");
                    summary.updated += 1;
                }
                Err(err) => {
                    warn!(source_id = %source_key, error = %err, "failed to mirror remote row");
                    summary.failed += 1;
                    if self.holds_cursor(&source_key, &err).await {
                        held = Some(held.map_or(modified, |held| held.min(modified)));
                        continue;
                    }
                }
            }

            self.failures.lock().await.remove(&source_key);
            passed.push(modified);
        }

        let next = passed
            .into_iter()
            .filter(|modified| held.is_none_or(|held| *modified < held))
            .max()
            .filter(|next| *next > cursor);

        if let Some(next) = next {
            if let Err(err) = self
                .retry
                .run("set_pull_cursor", || self.mirror.set_pull_cursor(name, next))
                .await
            {
                error!(
                    error = %err,
                    %next,
                    "failed to store pull cursor, the next pass will repeat these rows"
                );
                summary.log();
                return Err(err);
            }
            summary.cursor = Some(next);
        }

        if summary.failed > 0 {
            warn!(failed = summary.failed, "some remote rows were not mirrored in this pass");
        }
        summary.log();

        Ok(summary)
    }

    fn initial_cursor(&self) -> NaiveDateTime {
        let now = (self.clock)();
        now.checked_sub_days(Days::new(self.config.initial_lookback_days.into()))
            .unwrap_or(now)
    }

    fn source_id(&self, row: &FieldMap) -> Value {
        row.get(self.config.remote_field(&self.config.source_id_column))
            .cloned()
            .unwrap_or(Value::Null)
    }

    async fn mirror_row(&self, row: &FieldMap) -> SyncResult<Mirrored> {
        let source_id = self.source_id(row);
        if source_id.render().is_empty() {
            bail!(
                ErrorKind::InvalidData,
                "Remote row has no source id",
                self.config.remote_field(&self.config.source_id_column)
            );
        }

        let mut fields = map_columns(row, &self.config.columns);
        fields.insert(self.config.source_id_column.clone(), source_id.clone());

        let details = match &self.config.detail {
            Some(detail) => self
                .retry
                .run("fetch_details", || self.remote.fetch_details(&source_id))
                .await?
                .iter()
                .map(|detail_row| map_columns(detail_row, &detail.columns))
                .collect(),
            None => Vec::new(),
        };
        let mirrored = MirroredRow { fields, details };

        match self.find_local(&mirrored, &source_id).await? {
            Some(local_id) => {
                self.retry
                    .run("replace_mirrored", || {
                        self.mirror.replace_mirrored(&self.target, local_id, &mirrored)
                    })
                    .await?;

                Ok(Mirrored::Updated(local_id))
            }
            None => {
                let local_id = self
                    .retry
                    .run("insert_mirrored", || {
                        self.mirror.insert_mirrored(&self.target, &mirrored)
                    })
                    .await?;

                Ok(Mirrored::Inserted(local_id))
            }
        }
    }

    /// Finds the local row of a remote row: by source id first, then by order number.
    async fn find_local(
        &self,
        mirrored: &MirroredRow,
        source_id: &Value,
    ) -> SyncResult<Option<RecordId>> {
        let table = self.target.table.as_str();

        let by_source_id = self
            .retry
            .run("find_local", || {
                self.mirror
                    .find_local(table, &self.config.source_id_column, source_id)
            })
            .await?;
        if by_source_id.is_some() {
            return Ok(by_source_id);
        }

        let Some(order_no) = mirrored
            .fields
            .get(&self.config.order_no_column)
            .filter(|order_no| !order_no.render().is_empty())
        else {
            return Ok(None);
        };

        self.retry
            .run("find_local", || {
                self.mirror
                    .find_local(table, &self.config.order_no_column, order_no)
            })
            .await
    }

    /// Counts a failed row and returns whether it may hold back the cursor.
    async fn holds_cursor(&self, source_key: &str, err: &SyncError) -> bool {
        let mut failures = self.failures.lock().await;
        let attempts = failures.entry(source_key.to_string()).or_default();
        *attempts += 1;

        if *attempts >= self.max_row_attempts {
            error!(
                source_id = %source_key,
                attempts = *attempts,
                max_attempts = self.max_row_attempts,
                error = %err.summary(),
                "remote row kept failing, giving up on it"
            );
            failures.remove(source_key);
            return false;
        }

        true
    }
}

/// Renames remote fields to local columns. An empty mapping copies every field but `id`.
fn map_columns(row: &FieldMap, columns: &BTreeMap<String, String>) -> FieldMap {
    if columns.is_empty() {
        return row
            .iter()
            .filter(|(name, _)| name.as_str() != ID_FIELD)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
    }

    columns
        .iter()
        .map(|(local, remote)| {
            let value = row.get(remote).cloned().unwrap_or(Value::Null);
            (local.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mapping_copies_everything_but_the_id() {
        let row = FieldMap::from([
            ("id".to_string(), Value::Int(9)),
            ("bill_no".to_string(), Value::from("PO-1")),
        ]);

        let copied = map_columns(&row, &BTreeMap::new());
        let renamed = map_columns(
            &row,
            &BTreeMap::from([
                ("order_no".to_string(), "bill_no".to_string()),
                ("factory".to_string(), "factory".to_string()),
            ]),
        );

        assert_eq!(copied.keys().collect::<Vec<_>>(), vec!["bill_no"]);
        assert_eq!(renamed.get("order_no"), Some(&Value::from("PO-1")));
        assert_eq!(renamed.get("factory"), Some(&Value::Null));
    }
}
