//! Throwaway databases for tests that need a real Postgres server.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use sync_config::shared::{PoolConfig, SourceConfig, TlsConfig};
use uuid::Uuid;

use crate::db::migrate_state_schema;

/// Connection settings for a fresh, uniquely named test database.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
/// - `TESTS_DATABASE_PORT`: Postgres server port (required)
/// - `TESTS_DATABASE_USERNAME`: Database user (required)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
pub fn local_source_config() -> SourceConfig {
    SourceConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig::disabled(),
        pool: PoolConfig::default(),
    }
}

/// Creates the database named by `config` and returns a pool connected to it.
///
/// # Panics
/// Panics if connection or database creation fails.
pub async fn create_pg_database(config: &SourceConfig) -> PgPool {
    let mut connection = PgConnection::connect_with(&config.without_db())
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"create database "{}";"#, config.name))
        .await
        .expect("Failed to create database");

    PgPoolOptions::new()
        .max_connections(config.pool.max_connections)
        .connect_with(config.connect_options())
        .await
        .expect("Failed to connect to Postgres")
}

/// Terminates every connection to the database named by `config` and drops it.
///
/// Never panics, so cleanup does not mask the outcome of a test.
pub async fn drop_pg_database(config: &SourceConfig) {
    let mut connection = match PgConnection::connect_with(&config.without_db()).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("warning: failed to connect to Postgres for cleanup: {e}");
            return;
        }
    };

    if let Err(e) = connection
        .execute(&*format!(
            r#"
            select pg_terminate_backend(pg_stat_activity.pid)
            from pg_stat_activity
            where pg_stat_activity.datname = '{}'
            and pid <> pg_backend_pid();"#,
            config.name
        ))
        .await
    {
        eprintln!(
            "warning: failed to terminate connections for database {}: {}",
            config.name, e
        );
    }

    if let Err(e) = connection
        .execute(&*format!(r#"drop database if exists "{}";"#, config.name))
        .await
    {
        eprintln!("warning: failed to drop database {}: {}", config.name, e);
    }
}

/// A migrated test database, dropped again by [`StateDatabase::cleanup`].
#[derive(Debug)]
pub struct StateDatabase {
    pub config: SourceConfig,
    pub pool: PgPool,
}

impl StateDatabase {
    /// Runs a statement, typically to create a source table.
    ///
    /// # Panics
    /// Panics if the statement fails.
    pub async fn run_sql(&self, sql: &str) {
        self.pool
            .execute(sql)
            .await
            .unwrap_or_else(|e| panic!("Failed to run `{sql}`: {e}"));
    }

    pub async fn cleanup(self) {
        self.pool.close().await;
        drop_pg_database(&self.config).await;
    }
}

/// Creates a fresh database with the `sync` state schema migrated.
///
/// # Panics
/// Panics if the database cannot be created or migrated.
pub async fn spawn_state_database() -> StateDatabase {
    let config = local_source_config();
    let pool = create_pg_database(&config).await;

    migrate_state_schema(&config)
        .await
        .expect("Failed to migrate the state schema");

    StateDatabase { config, pool }
}
