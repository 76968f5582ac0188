use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Settings for the REST form API receiving the synced records.
///
/// Does not implement [`serde::Serialize`] so the API token cannot leak through serialization.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Endpoint accepting batched creates.
    pub create_url: String,
    /// Endpoint answering filtered lookups.
    pub query_url: String,
    /// Endpoint updating a single entity by id.
    pub update_url: String,
    /// Value of the `Authorization` header, sent as configured.
    pub api_token: SecretString,
    pub app_id: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Whether creates should start the form's workflow.
    #[serde(default)]
    pub start_workflow: bool,
}

impl SinkConfig {
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("sink.create_url", &self.create_url),
            ("sink.query_url", &self.query_url),
            ("sink.update_url", &self.update_url),
            ("sink.app_id", &self.app_id),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field.to_string()));
            }
        }

        Ok(())
    }
}

fn default_connect_timeout_ms() -> u64 {
    SinkConfig::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    SinkConfig::DEFAULT_REQUEST_TIMEOUT_MS
}
