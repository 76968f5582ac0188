use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batch sizing for extraction and create delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of rows read from the source per pass.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Maximum number of records sent in a single create call.
    #[serde(default = "default_create_size")]
    pub create_size: usize,
}

impl BatchConfig {
    pub const DEFAULT_MAX_SIZE: usize = 50;

    pub const DEFAULT_CREATE_SIZE: usize = 100;

    /// Ensures both sizes are non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.create_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.create_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            create_size: default_create_size(),
        }
    }
}

fn default_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}

fn default_create_size() -> usize {
    BatchConfig::DEFAULT_CREATE_SIZE
}
