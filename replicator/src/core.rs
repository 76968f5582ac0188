use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sync_config::shared::{
    BatchConfig, EntityConfig, PullConfig, ReplicatorConfig, RetryConfig, ScheduleConfig,
    SinkConfig, SourceConfig,
};
use sync_engine::concurrency::scheduler::{ScheduledPass, SchedulerReport, run_periodically};
use sync_engine::concurrency::shutdown::{ShutdownRx, create_shutdown_channel};
use sync_engine::error::SyncError;
use sync_engine::mapping::FieldMapping;
use sync_engine::pipeline::{PipelineSettings, SyncPipeline};
use sync_engine::pull::PullPipeline;
use sync_engine::sink::jiandaoyun::JiandaoyunClient;
use sync_engine::store::postgres::PostgresStore;
use sync_engine::store::remote::PostgresRemote;
use sync_postgres::db::{connect_to_source_database, migrate_state_schema};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::Args;
use crate::error::{ReplicatorError, ReplicatorResult, UnknownEntity};

type Pipeline = SyncPipeline<PostgresStore, JiandaoyunClient>;

type Pull = PullPipeline<PostgresRemote, PostgresStore>;

/// Starts the replicator with the provided configuration.
///
/// Connects to the source, migrates the state schema, builds one pipeline per selected entity
/// and one pull per enabled external table feeding them, and then either runs a single pass of
/// each (`--once`, pulls first) or runs them on the schedule until SIGINT or SIGTERM.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
    args: Args,
) -> ReplicatorResult<()> {
    info!("starting replicator service");

    log_config(&replicator_config);

    let entities = select_entities(&replicator_config, &args.entities)?;
    if entities.is_empty() {
        warn!("no enabled entities configured, nothing to do");
        return Ok(());
    }

    // Mappings are checked before touching the database so a bad deploy fails fast.
    let mut mappings = Vec::with_capacity(entities.len());
    for entity in &entities {
        let mapping = FieldMapping::load(&entity.mapping_path)?;
        debug!(
            entity = %entity.name,
            main_fields = mapping.main_fields.len(),
            sub_tables = mapping.sub_tables.len(),
            "loaded field mapping"
        );
        mappings.push(mapping);
    }

    migrate_state_schema(&replicator_config.source).await?;
    let pool = connect_to_source_database(&replicator_config.source).await?;
    let store = PostgresStore::new(pool.clone());
    let sink = JiandaoyunClient::new(&replicator_config.sink)?;

    let settings = PipelineSettings::from_config(
        &replicator_config.batch,
        &replicator_config.retry,
        &replicator_config.schedule,
    );

    let mut pipelines = Vec::with_capacity(entities.len());
    for (entity, mapping) in entities.into_iter().zip(mappings) {
        let pipeline = SyncPipeline::new(
            entity,
            mapping,
            settings.clone(),
            store.clone(),
            sink.clone(),
        )?;
        pipelines.push(Arc::new(pipeline));
    }

    let mut pulls = Vec::new();
    let mut remote_pools = Vec::new();
    for pull in select_pulls(&replicator_config, &args.entities) {
        let remote_pool = connect_to_source_database(&pull.remote).await?;
        let remote = PostgresRemote::new(remote_pool.clone(), &pull);
        pulls.push(Arc::new(PullPipeline::new(
            pull,
            &settings,
            remote,
            store.clone(),
        )));
        remote_pools.push(remote_pool);
    }

    let result = if args.once {
        run_once(&pulls, &pipelines).await
    } else {
        let period = Duration::from_secs(replicator_config.schedule.interval_secs);
        run_until_shutdown(pulls, pipelines, period).await
    };

    for remote_pool in remote_pools {
        remote_pool.close().await;
    }
    pool.close().await;
    info!("replicator service completed");

    result
}

/// Returns the enabled entities, narrowed down to `names` when given.
fn select_entities(
    config: &ReplicatorConfig,
    names: &[String],
) -> ReplicatorResult<Vec<EntityConfig>> {
    if names.is_empty() {
        return Ok(config.enabled_entities().cloned().collect());
    }

    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let Some(entity) = config
            .enabled_entities()
            .find(|entity| &entity.name == name)
        else {
            return Err(ReplicatorError::config(UnknownEntity(name.clone())));
        };

        if !selected.iter().any(|selected: &EntityConfig| &selected.name == name) {
            selected.push(entity.clone());
        }
    }

    Ok(selected)
}

/// Returns the enabled pulls feeding the selected entities.
///
/// Every enabled pull runs when no entity was named; otherwise only those whose push entity was
/// named.
fn select_pulls(config: &ReplicatorConfig, names: &[String]) -> Vec<PullConfig> {
    config
        .enabled_pulls()
        .filter(|pull| {
            names.is_empty()
                || pull
                    .push_entity
                    .as_ref()
                    .is_some_and(|entity| names.contains(entity))
        })
        .cloned()
        .collect()
}

/// Runs one pass of every pull, then one pass of every pipeline, each group concurrently, and
/// fails if any pass failed.
async fn run_once(pulls: &[Arc<Pull>], pipelines: &[Arc<Pipeline>]) -> ReplicatorResult<()> {
    let mut errors = Vec::new();

    let results = join_all(pulls.iter().map(|pull| pull.run_pass())).await;
    for (pull, result) in pulls.iter().zip(results) {
        match result {
            Ok(summary) => {
                if summary.failed > 0 {
                    warn!(
                        pull = %pull.config().name,
                        failed = summary.failed,
                        "pull finished with rows not mirrored"
                    );
                }
            }
            Err(err) => {
                error!(pull = %pull.config().name, error = %err, "pull pass failed");
                errors.push(err);
            }
        }
    }

    let results = join_all(pipelines.iter().map(|pipeline| pipeline.run_pass())).await;
    for (pipeline, result) in pipelines.iter().zip(results) {
        match result {
            Ok(summary) => {
                if summary.lost() > 0 {
                    warn!(
                        entity = %pipeline.entity().name,
                        lost = summary.lost(),
                        "pass finished with undelivered records"
                    );
                }
            }
            Err(err) => {
                error!(entity = %pipeline.entity().name, error = %err, "sync pass failed");
                errors.push(err);
            }
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0).into()),
        _ => Err(SyncError::from(errors).into()),
    }
}

fn spawn_scheduled<P>(
    passes: Vec<Arc<P>>,
    period: Duration,
    shutdown_rx: &ShutdownRx,
) -> Vec<JoinHandle<SchedulerReport>>
where
    P: ScheduledPass + Send + Sync + 'static,
{
    passes
        .into_iter()
        .map(|pass| tokio::spawn(run_periodically(pass, period, shutdown_rx.clone())))
        .collect()
}

/// Runs every pull and pipeline on its schedule until SIGINT or SIGTERM.
///
/// Passes already running when the signal arrives are completed before this returns.
async fn run_until_shutdown(
    pulls: Vec<Arc<Pull>>,
    pipelines: Vec<Arc<Pipeline>>,
    period: Duration,
) -> ReplicatorResult<()> {
    // Listen for SIGTERM, sent by orchestrators before SIGKILL.
    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let mut handles = spawn_scheduled(pulls, period, &shutdown_rx);
    handles.extend(spawn_scheduled(pipelines, period, &shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("sigint (ctrl+c) received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("sigterm received, shutting down");
        }
    }

    if let Err(err) = shutdown_tx.send(true) {
        warn!(error = ?err, "failed to send shutdown signal");
    }

    for result in join_all(handles).await {
        match result {
            Ok(report) => {
                info!(
                    passes = report.passes,
                    failed_passes = report.failed_passes,
                    "scheduler stopped"
                );
            }
            Err(err) => {
                error!(error = %err, "scheduler task panicked or was cancelled");
            }
        }
    }

    Ok(())
}

fn log_config(config: &ReplicatorConfig) {
    log_source_config(&config.source);
    log_sink_config(&config.sink);
    log_batch_config(&config.batch);
    log_retry_config(&config.retry);
    log_schedule_config(&config.schedule);

    for pull in &config.pulls {
        debug!(
            pull = %pull.name,
            remote_host = %pull.remote.host,
            remote_table = %pull.remote_table,
            local_table = %pull.local_table,
            enabled = pull.enabled,
            push_entity = ?pull.push_entity,
            "pull config"
        );
    }

    for entity in &config.entities {
        debug!(
            entity = %entity.name,
            table = %entity.table,
            entry_id = %entity.entry_id,
            enabled = entity.enabled,
            fold = ?entity.fold,
            extraction = ?entity.extraction,
            "entity config"
        );
    }
}

fn log_source_config(config: &SourceConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "source postgres connection config",
    );
}

fn log_sink_config(config: &SinkConfig) {
    debug!(
        create_url = config.create_url,
        query_url = config.query_url,
        update_url = config.update_url,
        app_id = config.app_id,
        connect_timeout_ms = config.connect_timeout_ms,
        request_timeout_ms = config.request_timeout_ms,
        "sink config"
    );
}

fn log_batch_config(config: &BatchConfig) {
    debug!(
        max_size = config.max_size,
        create_size = config.create_size,
        "batch config"
    );
}

fn log_retry_config(config: &RetryConfig) {
    debug!(
        max_attempts = config.max_attempts,
        delay_ms = config.delay_ms,
        "retry config"
    );
}

fn log_schedule_config(config: &ScheduleConfig) {
    debug!(
        interval_secs = config.interval_secs,
        delayed_update_wait_ms = config.delayed_update_wait_ms,
        "schedule config"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReplicatorConfig {
        serde_json::from_value(serde_json::json!({
            "source": {
                "host": "localhost",
                "port": 5432,
                "name": "erp",
                "username": "sync"
            },
            "sink": {
                "create_url": "http://sink/create",
                "query_url": "http://sink/query",
                "update_url": "http://sink/update",
                "api_token": "token",
                "app_id": "app"
            },
            "entities": [
                { "name": "orders", "table": "oms_order", "entry_id": "e1", "mapping_path": "orders.json" },
                { "name": "dm", "table": "oms_dm", "entry_id": "e2", "mapping_path": "dm.json", "enabled": false },
                { "name": "invoices", "table": "oms_invoice", "entry_id": "e3", "mapping_path": "invoices.json" }
            ],
            "pulls": [
                pull("dm_orders", Some("orders"), true),
                pull("dm_archive", Some("orders"), false),
                pull("dm_plain", None, true)
            ]
        }))
        .unwrap()
    }

    fn pull(name: &str, push_entity: Option<&str>, enabled: bool) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "enabled": enabled,
            "remote": { "host": "remote", "port": 5432, "name": "dm", "username": "reader" },
            "remote_table": "orders",
            "modify_time_field": "modify_time",
            "local_table": "dm_order",
            "push_entity": push_entity
        })
    }

    fn names(entities: &[EntityConfig]) -> Vec<&str> {
        entities.iter().map(|entity| entity.name.as_str()).collect()
    }

    #[test]
    fn selects_enabled_entities_by_default() {
        let selected = select_entities(&config(), &[]).unwrap();
        assert_eq!(names(&selected), vec!["orders", "invoices"]);
    }

    #[test]
    fn narrows_down_to_named_entities() {
        let requested = vec!["invoices".to_string(), "invoices".to_string()];
        let selected = select_entities(&config(), &requested).unwrap();
        assert_eq!(names(&selected), vec!["invoices"]);
    }

    #[test]
    fn rejects_disabled_or_unknown_entities() {
        for name in ["dm", "missing"] {
            let err = select_entities(&config(), &[name.to_string()]).unwrap_err();
            assert_eq!(err.category(), "configuration error");
        }
    }

    #[test]
    fn pulls_follow_the_selected_entities() {
        let pull_names = |names: &[&str]| {
            let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
            select_pulls(&config(), &names)
                .into_iter()
                .map(|pull| pull.name)
                .collect::<Vec<_>>()
        };

        assert_eq!(pull_names(&[]), vec!["dm_orders", "dm_plain"]);
        assert_eq!(pull_names(&["orders"]), vec!["dm_orders"]);
        assert!(pull_names(&["invoices"]).is_empty());
    }
}
