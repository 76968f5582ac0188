use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Period between two passes of the same entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Wait before delayed updates are reconciled, letting creates settle externally.
    #[serde(default = "default_delayed_update_wait_ms")]
    pub delayed_update_wait_ms: u64,
}

impl ScheduleConfig {
    pub const DEFAULT_INTERVAL_SECS: u64 = 5 * 60;

    pub const DEFAULT_DELAYED_UPDATE_WAIT_MS: u64 = 3_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_secs == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "schedule.interval_secs".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            delayed_update_wait_ms: default_delayed_update_wait_ms(),
        }
    }
}

fn default_interval_secs() -> u64 {
    ScheduleConfig::DEFAULT_INTERVAL_SECS
}

fn default_delayed_update_wait_ms() -> u64 {
    ScheduleConfig::DEFAULT_DELAYED_UPDATE_WAIT_MS
}
