use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::shared::ValidationError;

/// Application name reported by replicator connections.
const APP_NAME_REPLICATOR: &str = "sync_replicator";

/// Session settings applied to every pooled connection.
const SESSION_OPTIONS: &[(&str, &str)] = &[
    ("datestyle", "ISO"),
    ("client_encoding", "UTF8"),
    ("statement_timeout", "30000"),
    ("lock_timeout", "10000"),
];

/// Connection settings for the relational source of record.
///
/// The same database also hosts the sync state schema (watermarks and delivery ledger).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: Option<SecretString>,
    #[serde(default = "TlsConfig::disabled")]
    pub tls: TlsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyField("source.host".to_string()));
        }

        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("source.name".to_string()));
        }

        if self.tls.enabled && self.tls.trusted_root_certs.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "source.tls.trusted_root_certs".to_string(),
                constraint: "must be set when tls is enabled".to_string(),
            });
        }

        self.pool.validate()
    }

    /// Builds sqlx connect options targeting the configured database.
    pub fn connect_options(&self) -> PgConnectOptions {
        self.without_db().database(&self.name)
    }

    /// Builds connect options for the server without selecting a database, for administrative
    /// statements such as `create database`.
    pub fn without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            PgSslMode::VerifyFull
        } else {
            PgSslMode::Prefer
        };

        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .application_name(APP_NAME_REPLICATOR)
            .ssl_mode(ssl_mode)
            .options(SESSION_OPTIONS.iter().copied());

        if self.tls.enabled {
            options = options.ssl_root_cert_from_pem(self.tls.trusted_root_certs.clone().into_bytes());
        }

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self {
            trusted_root_certs: String::new(),
            enabled: false,
        }
    }
}

/// Connection pool sizing. The pool is shared by every entity pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl PoolConfig {
    pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(ValidationError::InvalidFieldValue {
                field: "source.pool".to_string(),
                constraint: "max_connections must be positive and at least min_connections"
                    .to_string(),
            });
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_min_connections() -> u32 {
    PoolConfig::DEFAULT_MIN_CONNECTIONS
}

fn default_max_connections() -> u32 {
    PoolConfig::DEFAULT_MAX_CONNECTIONS
}
