use tracing::info;

use crate::types::RecordId;

/// Counts of one pass, logged once at its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub entity: String,
    /// Rows extracted, malformed ones included.
    pub total: usize,
    /// Rows that could not be decoded.
    pub malformed: usize,
    /// Rows carrying every required field.
    pub valid: usize,
    pub invalid: usize,
    /// Rows dropped as content duplicates.
    pub duplicates: usize,
    pub transform_failed: usize,
    pub reconcile_failed: usize,
    /// Records found in the external system.
    pub existing: usize,
    pub updated: usize,
    pub created: usize,
    /// Creates and updates that failed after every retry.
    pub failed: usize,
    pub sequence_codes_assigned: u32,
    /// Stored `last_id` after the pass.
    pub watermark: Option<RecordId>,
}

impl PassSummary {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    /// Records lost for this pass.
    pub fn lost(&self) -> usize {
        self.malformed + self.invalid + self.transform_failed + self.reconcile_failed + self.failed
    }

    pub fn log(&self) {
        info!(
            entity = %self.entity,
            total = self.total,
            malformed = self.malformed,
            valid = self.valid,
            invalid = self.invalid,
            duplicates = self.duplicates,
            transform_failed = self.transform_failed,
            reconcile_failed = self.reconcile_failed,
            existing = self.existing,
            updated = self.updated,
            created = self.created,
            failed = self.failed,
            sequence_codes_assigned = self.sequence_codes_assigned,
            watermark = ?self.watermark,
            "sync pass summary"
        );
    }
}
