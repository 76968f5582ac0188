use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Fixed-delay retry settings shared by extraction, lookup and delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between two attempts, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Passes a record whose lookup keeps failing may hold back the cursor before it is given
    /// up as lost.
    #[serde(default = "default_max_record_attempts")]
    pub max_record_attempts: u32,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

    pub const DEFAULT_DELAY_MS: u64 = 5_000;

    pub const DEFAULT_MAX_RECORD_ATTEMPTS: u32 = 5;

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("retry.max_attempts", self.max_attempts),
            ("retry.max_record_attempts", self.max_record_attempts),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: field.to_string(),
                    constraint: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            max_record_attempts: default_max_record_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_delay_ms() -> u64 {
    RetryConfig::DEFAULT_DELAY_MS
}

fn default_max_record_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_RECORD_ATTEMPTS
}
