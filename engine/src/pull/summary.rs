use chrono::NaiveDateTime;
use tracing::info;

/// Counts of one pull pass, logged once at its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub pull: String,
    /// Remote rows read.
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    /// Stored modify-time cursor after the pass.
    pub cursor: Option<NaiveDateTime>,
}

impl PullSummary {
    pub fn new(pull: impl Into<String>) -> Self {
        Self {
            pull: pull.into(),
            ..Default::default()
        }
    }

    pub fn log(&self) {
        info!(
            pull = %self.pull,
            total = self.total,
            inserted = self.inserted,
            updated = self.updated,
            failed = self.failed,
            cursor = ?self.cursor,
            "pull pass summary"
        );
    }
}
