use std::sync::Once;

use sync_config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable naming a directory for daily rolling log files.
const LOG_DIR_ENV_NAME: &str = "LOG_DIR";

/// Environment variable enabling log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine environment: {0}")]
    Environment(#[from] std::io::Error),

    #[error("failed to bridge `log` records into tracing: {0}")]
    LogBridge(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the file writer alive; dropping it flushes pending log lines.
#[must_use = "dropping the flusher stops file logging"]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber for a binary.
///
/// Production logs are JSON, development logs are human readable. When `LOG_DIR` is set,
/// a daily rolling file named after `app_name` receives a JSON copy of every event.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;

    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout_layer = if environment.is_prod() {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().pretty().boxed()
    };

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV_NAME) {
        Ok(log_dir) => {
            let appender = tracing_appender::rolling::daily(log_dir, format!("{app_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    ::tracing::info!(app = app_name, environment = %environment, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test-writer subscriber once per process when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
