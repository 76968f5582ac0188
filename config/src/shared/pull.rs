use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::shared::{SourceConfig, ValidationError};

/// Local column holding the remote identifier unless overridden.
pub const DEFAULT_SOURCE_ID_COLUMN: &str = "source_id";

/// Local column holding the business order number unless overridden.
pub const DEFAULT_ORDER_NO_COLUMN: &str = "order_no";

/// Child rows of a mirrored table, replaced wholesale on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullDetailConfig {
    pub remote_table: String,
    /// Column of the remote child table holding the remote identifier of its parent.
    pub remote_foreign_key: String,
    pub local_table: String,
    /// Column of the local child table receiving the local id of its parent.
    pub local_foreign_key: String,
    /// Local column to remote field. Empty copies every remote field under its own name.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

/// Copies changed rows from an external database into local tables.
///
/// Rows are read in modify-time order above a stored cursor and matched to local rows by source
/// id first, then by order number.
#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    /// Cursor key and log label.
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connection to the external database.
    pub remote: SourceConfig,
    pub remote_table: String,
    /// Remote timestamp column ordering and filtering the incremental read.
    pub modify_time_field: String,
    pub local_table: String,
    #[serde(default = "default_source_id_column")]
    pub source_id_column: String,
    #[serde(default = "default_order_no_column")]
    pub order_no_column: String,
    /// Local column to remote field. Empty copies every remote field under its own name.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub detail: Option<PullDetailConfig>,
    /// Entity pushing the local table, whose delivery ledger entry is cleared when a row is
    /// refreshed.
    #[serde(default)]
    pub push_entity: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How far back the first pull reaches when no cursor was stored yet.
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: u32,
}

impl PullConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub const DEFAULT_INITIAL_LOOKBACK_DAYS: u32 = 7;

    /// Remote field feeding a local column.
    pub fn remote_field<'a>(&'a self, local_column: &'a str) -> &'a str {
        self.columns
            .get(local_column)
            .map(String::as_str)
            .unwrap_or(local_column)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("pulls.name".to_string()));
        }

        self.remote.validate()?;

        let mut required = vec![
            ("remote_table", &self.remote_table),
            ("modify_time_field", &self.modify_time_field),
            ("local_table", &self.local_table),
            ("source_id_column", &self.source_id_column),
            ("order_no_column", &self.order_no_column),
        ];
        if let Some(detail) = &self.detail {
            required.extend([
                ("detail.remote_table", &detail.remote_table),
                ("detail.remote_foreign_key", &detail.remote_foreign_key),
                ("detail.local_table", &detail.local_table),
                ("detail.local_foreign_key", &detail.local_foreign_key),
            ]);
        }
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(format!(
                    "pulls.{}.{field}",
                    self.name
                )));
            }
        }

        let mapped_columns = self
            .columns
            .keys()
            .chain(self.detail.iter().flat_map(|detail| detail.columns.keys()));
        for column in mapped_columns {
            if column == "id" {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("pulls.{}.columns", self.name),
                    constraint: "local `id` columns are assigned locally and cannot be mapped"
                        .to_string(),
                });
            }
        }

        if self.batch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("pulls.{}.batch_size", self.name),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_source_id_column() -> String {
    DEFAULT_SOURCE_ID_COLUMN.to_string()
}

fn default_order_no_column() -> String {
    DEFAULT_ORDER_NO_COLUMN.to_string()
}

fn default_batch_size() -> usize {
    PullConfig::DEFAULT_BATCH_SIZE
}

fn default_initial_lookback_days() -> u32 {
    PullConfig::DEFAULT_INITIAL_LOOKBACK_DAYS
}
