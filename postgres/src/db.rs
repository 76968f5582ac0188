use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use sync_config::shared::SourceConfig;
use tracing::info;

/// Schema holding watermarks, the delivery ledger and the migrations table.
pub const STATE_SCHEMA: &str = "sync";

/// Connects the pool shared by every entity pipeline.
pub async fn connect_to_source_database(config: &SourceConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.pool.min_connections)
        .max_connections(config.pool.max_connections)
        .connect_with(config.connect_options())
        .await?;

    info!(
        host = %config.host,
        database = %config.name,
        max_connections = config.pool.max_connections,
        "connected to source database"
    );

    Ok(pool)
}

/// Creates the state schema if needed and applies pending migrations.
///
/// Runs on a dedicated single connection whose `search_path` points at the state schema, so
/// the `_sqlx_migrations` bookkeeping table lands there instead of `public`.
pub async fn migrate_state_schema(config: &SourceConfig) -> Result<(), sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists sync;").await?;
                conn.execute("set search_path = 'sync';").await?;
                Ok(())
            })
        })
        .connect_with(config.connect_options())
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    pool.close().await;

    info!(schema = STATE_SCHEMA, "state schema migrated");

    Ok(())
}
