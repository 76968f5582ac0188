//! Error types and result definitions for sync operations.
//!
//! [`SyncError`] carries a classification ([`ErrorKind`]), a static description, an optional
//! dynamic detail, an optional source error and the callsite that raised it. Several errors can
//! be aggregated into one, which the scheduler uses when more than one entity pipeline fails.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the engine.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Classification of sync failures.
///
/// Kinds fall into three groups that drive handling: transient infrastructure failures are
/// retried (see [`ErrorKind::is_retryable`]), data failures skip a single record, and
/// configuration failures stop the process at startup.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Source database
    SourceConnectionFailed,
    SourceQueryFailed,

    // External sink
    SinkConnectionFailed,
    SinkRequestFailed,
    SinkRejected,
    SinkResponseInvalid,

    // State persistence
    WatermarkStoreFailed,
    LedgerStoreFailed,
    MirrorWriteFailed,

    // Data
    ConversionError,
    InvalidData,

    // Configuration
    ConfigError,
    MappingMissing,

    // IO & serialization
    IoError,
    SerializationError,
    DeserializationError,

    // Workflow
    InvalidState,
    PassInProgress,

    Unknown,
}

impl ErrorKind {
    /// Returns `true` for failures worth another attempt with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::SourceQueryFailed
                | ErrorKind::SinkConnectionFailed
                | ErrorKind::SinkRequestFailed
                | ErrorKind::SinkRejected
                | ErrorKind::SinkResponseInvalid
                | ErrorKind::WatermarkStoreFailed
                | ErrorKind::LedgerStoreFailed
                | ErrorKind::MirrorWriteFailed
                | ErrorKind::IoError
                | ErrorKind::Unknown
        )
    }
}

impl SyncError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the dynamic detail, or the first detail found in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, if this is an aggregate.
    pub fn errors(&self) -> Option<&[SyncError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. Has no effect on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Returns a one-line rendering without location, suitable for persisting next to a record.
    pub fn summary(&self) -> String {
        match &self.repr {
            ErrorRepr::Single(payload) => match &payload.detail {
                Some(detail) => format!("[{:?}] {}: {}", payload.kind, payload.description, detail),
                None => format!("[{:?}] {}", payload.kind, payload.description),
            },
            ErrorRepr::Many { errors, .. } => errors
                .iter()
                .map(SyncError::summary)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for SyncError {
    /// Hashes kind and static description only, so repeated occurrences group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();
        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DeserializationError, "JSON deserialization failed")
            }
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<chrono::ParseError> for SyncError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Date or time parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps pool exhaustion and IO to connection failures, everything else to query failures.
impl From<sqlx::Error> for SyncError {
    #[track_caller]
    fn from(err: sqlx::Error) -> SyncError {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut => ErrorKind::SourceConnectionFailed,
            sqlx::Error::Configuration(_) => ErrorKind::ConfigError,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                ErrorKind::ConversionError
            }
            _ => ErrorKind::SourceQueryFailed,
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps connect failures and timeouts to [`ErrorKind::SinkConnectionFailed`].
impl From<reqwest::Error> for SyncError {
    #[track_caller]
    fn from(err: reqwest::Error) -> SyncError {
        let (kind, description) = if err.is_connect() || err.is_timeout() {
            (ErrorKind::SinkConnectionFailed, "Sink connection failed")
        } else if err.is_decode() {
            (ErrorKind::SinkResponseInvalid, "Sink response could not be decoded")
        } else {
            (ErrorKind::SinkRequestFailed, "Sink request failed")
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
