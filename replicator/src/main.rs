//! Sync replicator binary.
//!
//! Loads the configuration, initializes tracing, and runs the entity pipelines either once or on
//! their schedule until a shutdown signal arrives.

use clap::Parser;
use sync_config::shared::ReplicatorConfig;
use sync_telemetry::tracing::init_tracing;
use tracing::error;

use crate::cli::Args;
use crate::config::load_replicator_config;
use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod cli;
mod config;
mod core;
mod error;

fn main() -> ReplicatorResult<()> {
    let args = Args::parse();

    let replicator_config = load_replicator_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(ReplicatorError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config, args))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig, args: Args) -> ReplicatorResult<()> {
    if let Err(err) = start_replicator_with_config(replicator_config, args).await {
        error!(category = err.category(), "{err}");
        return Err(err);
    }

    Ok(())
}
