use std::collections::BTreeMap;
use std::future::Future;

use chrono::NaiveDateTime;

use crate::error::SyncResult;
use crate::types::{RawRecord, RecordId, Value, Watermark};

/// Columns of a row without an identity of their own, by name.
pub type FieldMap = BTreeMap<String, Value>;

/// Rows returned by one extraction read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    /// Decoded rows, in ascending id order.
    pub records: Vec<RawRecord>,
    /// Rows that could not be decoded, by id when the id itself was readable.
    pub malformed: Vec<Option<RecordId>>,
}

impl SourceBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            malformed: Vec::new(),
        }
    }

    /// Number of rows read, malformed ones included.
    pub fn len(&self) -> usize {
        self.records.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest id read, malformed rows included.
    pub fn max_id(&self) -> Option<RecordId> {
        self.records
            .iter()
            .map(RawRecord::id)
            .chain(self.malformed.iter().flatten().copied())
            .max()
    }
}

/// Read access to the source of record.
///
/// Implementations must return rows in ascending id order and never more than `limit` rows.
/// Rows that cannot be decoded are reported in [`SourceBatch::malformed`] instead of failing
/// the read.
pub trait SourceStore {
    /// Returns rows of `table` with an id strictly greater than `after`.
    ///
    /// `after == None` reads from the beginning of the table.
    fn fetch_batch(
        &self,
        table: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> impl Future<Output = SyncResult<SourceBatch>> + Send;

    /// Returns rows of `table` not yet delivered for `entity` whose persisted attempt count is
    /// below `max_attempts`.
    fn fetch_pending(
        &self,
        entity: &str,
        table: &str,
        max_attempts: u32,
        limit: usize,
    ) -> impl Future<Output = SyncResult<SourceBatch>> + Send;

    /// Returns the child rows of `table` whose `foreign_key` references one of `parent_ids`.
    fn fetch_children(
        &self,
        table: &str,
        foreign_key: &str,
        parent_ids: &[RecordId],
    ) -> impl Future<Output = SyncResult<Vec<RawRecord>>> + Send;
}

/// Persistence of per-entity progress.
pub trait WatermarkStore {
    /// Returns the stored watermark, or `None` if the entity never completed a pass.
    fn get_watermark(
        &self,
        entity: &str,
    ) -> impl Future<Output = SyncResult<Option<Watermark>>> + Send;

    /// Stores the watermark. The stored `last_id` never decreases.
    fn set_watermark(
        &self,
        entity: &str,
        watermark: &Watermark,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Per-record delivery bookkeeping.
pub trait DeliveryLedger {
    /// Flags all `ids` as delivered in a single commit.
    fn mark_delivered(
        &self,
        entity: &str,
        ids: &[RecordId],
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Increments the attempt counter of a record and stores its last error.
    ///
    /// Returns the new attempt count.
    fn record_failure(
        &self,
        entity: &str,
        id: RecordId,
        error: &str,
    ) -> impl Future<Output = SyncResult<u32>> + Send;
}

/// Maximum number of characters of an error persisted next to a record.
pub const MAX_ERROR_LENGTH: usize = 500;

/// Truncates an error message to [`MAX_ERROR_LENGTH`] characters.
pub fn truncate_error(error: &str) -> &str {
    match error.char_indices().nth(MAX_ERROR_LENGTH) {
        Some((index, _)) => &error[..index],
        None => error,
    }
}

/// Read access to an external database mirrored into local tables.
pub trait RemoteSource {
    /// Returns up to `limit` rows modified strictly after `since`, oldest first.
    ///
    /// Rows that cannot be decoded are skipped.
    fn fetch_modified(
        &self,
        since: NaiveDateTime,
        limit: usize,
    ) -> impl Future<Output = SyncResult<Vec<FieldMap>>> + Send;

    /// Returns the child rows of the remote row identified by `parent`.
    fn fetch_details(
        &self,
        parent: &Value,
    ) -> impl Future<Output = SyncResult<Vec<FieldMap>>> + Send;
}

/// Child table of a mirrored table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDetail {
    pub table: String,
    /// Column receiving the local id of the parent row.
    pub foreign_key: String,
}

/// Local tables receiving mirrored rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub table: String,
    pub detail: Option<MirrorDetail>,
    /// Entity whose delivery ledger entry is cleared when a row is replaced.
    pub ledger_entity: Option<String>,
}

/// A remote row and its children, keyed by local column names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirroredRow {
    pub fields: FieldMap,
    pub details: Vec<FieldMap>,
}

/// Write access to the local tables mirroring an external database.
pub trait LocalMirror {
    /// Returns the lowest local id whose `column` renders as `value`.
    fn find_local(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> impl Future<Output = SyncResult<Option<RecordId>>> + Send;

    /// Inserts a row with its details and returns the new local id.
    fn insert_mirrored(
        &self,
        target: &MirrorTarget,
        row: &MirroredRow,
    ) -> impl Future<Output = SyncResult<RecordId>> + Send;

    /// Overwrites the columns of a local row, replaces its details and clears its ledger
    /// entry, atomically.
    fn replace_mirrored(
        &self,
        target: &MirrorTarget,
        local_id: RecordId,
        row: &MirroredRow,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Persistence of per-pull modify-time cursors.
pub trait PullCursorStore {
    fn get_pull_cursor(
        &self,
        name: &str,
    ) -> impl Future<Output = SyncResult<Option<NaiveDateTime>>> + Send;

    /// Stores the cursor. A cursor older than the stored one is ignored.
    fn set_pull_cursor(
        &self,
        name: &str,
        cursor: NaiveDateTime,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
