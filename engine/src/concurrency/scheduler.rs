//! Runs pipelines on a fixed period until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested, wait_for_shutdown};
use crate::error::{ErrorKind, SyncResult};
use crate::pipeline::SyncPipeline;
use crate::pull::PullPipeline;
use crate::sink::Sink;
use crate::store::{
    DeliveryLedger, LocalMirror, PullCursorStore, RemoteSource, SourceStore, WatermarkStore,
};

/// Pass counts of a scheduler loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub passes: u64,
    pub failed_passes: u64,
}

/// Work run once per scheduler tick.
pub trait ScheduledPass {
    /// Name of the work in logs.
    fn task_name(&self) -> &str;

    fn run_scheduled(&self) -> impl Future<Output = SyncResult<()>> + Send;
}

impl<S, K> ScheduledPass for SyncPipeline<S, K>
where
    S: SourceStore + WatermarkStore + DeliveryLedger + Send + Sync,
    K: Sink + Send + Sync,
{
    fn task_name(&self) -> &str {
        &self.entity().name
    }

    async fn run_scheduled(&self) -> SyncResult<()> {
        self.run_pass().await.map(|_| ())
    }
}

impl<R, M> ScheduledPass for PullPipeline<R, M>
where
    R: RemoteSource + Send + Sync,
    M: LocalMirror + PullCursorStore + Send + Sync,
{
    fn task_name(&self) -> &str {
        &self.config().name
    }

    async fn run_scheduled(&self) -> SyncResult<()> {
        self.run_pass().await.map(|_| ())
    }
}

/// Runs a pass immediately and then every `period`, until shutdown is requested.
///
/// A pass that has started always runs to completion; the shutdown request is only observed
/// between passes. A slow pass delays the next tick instead of causing a burst of passes.
pub async fn run_periodically<P>(
    pass: Arc<P>,
    period: Duration,
    mut shutdown_rx: ShutdownRx,
) -> SchedulerReport
where
    P: ScheduledPass + Send + Sync,
{
    let task = pass.task_name().to_string();
    let mut report = SchedulerReport::default();

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(%task, period_secs = period.as_secs(), "starting scheduler");

    loop {
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown_rx) => {
                info!(%task, "shutdown requested, stopping scheduler");
                break;
            }
            _ = ticker.tick() => {}
        }

        if is_shutdown_requested(&shutdown_rx) {
            break;
        }

        report.passes += 1;
        if let Err(err) = pass.run_scheduled().await {
            report.failed_passes += 1;
            if err.kind() == ErrorKind::PassInProgress {
                info!(%task, "previous pass still running, skipping tick");
            } else {
                error!(%task, error = %err, "scheduled pass failed");
            }
        }
    }

    report
}
