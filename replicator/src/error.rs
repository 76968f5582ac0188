use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use sync_engine::error::SyncError;
use thiserror::Error;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Captured backtrace wrapper to avoid thiserror's unstable feature detection.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raised when `--entity` names an entity that is not configured or not enabled.
#[derive(Debug, Error)]
#[error("entity `{0}` is not configured or not enabled")]
pub struct UnknownEntity(pub String);

/// Error type for the replicator service.
#[derive(Debug)]
pub enum ReplicatorError {
    /// Engine error, from startup or from a pass.
    Sync(SyncError),
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// Connecting to the source or migrating the state schema failed.
    Database(sqlx::Error, CapturedBacktrace),
    Io(std::io::Error, CapturedBacktrace),
}

impl ReplicatorError {
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ReplicatorError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Sync(_) => "sync error",
            ReplicatorError::Config(_, _) => "configuration error",
            ReplicatorError::Database(_, _) => "database error",
            ReplicatorError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ReplicatorError::Sync(err) => err.backtrace(),
            ReplicatorError::Config(_, cb) => Some(&cb.0),
            ReplicatorError::Database(_, cb) => Some(&cb.0),
            ReplicatorError::Io(_, cb) => Some(&cb.0),
        }
    }
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorError::Sync(err) => write!(f, "{err}"),
            ReplicatorError::Config(source, _) => write!(f, "configuration error: {source}"),
            ReplicatorError::Database(source, _) => write!(f, "database error: {source}"),
            ReplicatorError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for ReplicatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicatorError::Sync(err) => err.source(),
            ReplicatorError::Config(source, _) => Some(source.as_ref()),
            ReplicatorError::Database(source, _) => Some(source),
            ReplicatorError::Io(source, _) => Some(source),
        }
    }
}

impl From<sqlx::Error> for ReplicatorError {
    fn from(err: sqlx::Error) -> Self {
        ReplicatorError::Database(err, CapturedBacktrace::capture())
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<SyncError> for ReplicatorError {
    fn from(err: SyncError) -> Self {
        ReplicatorError::Sync(err)
    }
}
