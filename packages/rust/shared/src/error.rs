//! Error types for docenrich.
//!
//! Library crates use [`DocEnrichError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Transient vs. terminal classification of a generation service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The request or the response body timed out.
    Timeout,
    /// HTTP 429. `retry_after` carries the server hint when present.
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 5xx (and 408).
    Server { status: u16 },
    /// Connection reset, DNS failure, truncated body.
    Transport,
    /// Any other non-success status (bad key, bad request). Not retried.
    Rejected { status: u16 },
}

impl ServiceErrorKind {
    /// Whether a request failing this way may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

impl std::fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited { .. } => write!(f, "rate limited"),
            Self::Server { status } => write!(f, "server error {status}"),
            Self::Transport => write!(f, "transport error"),
            Self::Rejected { status } => write!(f, "rejected with status {status}"),
        }
    }
}

/// Top-level error type for all docenrich operations.
#[derive(Debug, thiserror::Error)]
pub enum DocEnrichError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The generation service failed to produce a response.
    #[error("service error ({kind}): {message}")]
    Service {
        kind: ServiceErrorKind,
        message: String,
    },

    /// The service answered, but not with the expected structured object.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Local fingerprint cache failure. Callers treat this as a miss.
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// Writing the merged batch failed. Fatal for the run.
    #[error("persist error at {path:?}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A line of the input batch could not be parsed.
    #[error("source error at {path:?} line {line}: {message}")]
    Source {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// An enrichment task died before reporting an outcome.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocEnrichError>;

impl DocEnrichError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a service error of the given kind.
    pub fn service(kind: ServiceErrorKind, msg: impl Into<String>) -> Self {
        Self::Service {
            kind,
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a `std::io::Error` raised while writing the output batch.
    pub fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }

    /// Only transient service failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Service { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Stable short name of the error class, used in logs and run reports.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Service { .. } => "service",
            Self::MalformedResponse(_) => "malformed_response",
            Self::CacheIo(_) => "cache_io",
            Self::Persist { .. } => "persist",
            Self::Source { .. } => "source",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
            Self::Worker(_) => "worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DocEnrichError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = DocEnrichError::service(ServiceErrorKind::Server { status: 503 }, "busy");
        assert_eq!(err.to_string(), "service error (server error 503): busy");
    }

    #[test]
    fn only_transient_service_errors_retry() {
        assert!(DocEnrichError::service(ServiceErrorKind::Timeout, "t").is_retryable());
        assert!(
            DocEnrichError::service(
                ServiceErrorKind::RateLimited { retry_after: None },
                "slow down"
            )
            .is_retryable()
        );
        assert!(DocEnrichError::service(ServiceErrorKind::Transport, "reset").is_retryable());
        assert!(
            !DocEnrichError::service(ServiceErrorKind::Rejected { status: 401 }, "bad key")
                .is_retryable()
        );
        assert!(!DocEnrichError::MalformedResponse("not json".into()).is_retryable());
        assert!(!DocEnrichError::CacheIo("disk full".into()).is_retryable());
    }

    #[test]
    fn class_names_are_stable() {
        assert_eq!(DocEnrichError::MalformedResponse("x".into()).class(), "malformed_response");
        assert_eq!(
            DocEnrichError::persist("/tmp/out.jsonl", std::io::Error::other("boom")).class(),
            "persist"
        );
        assert_eq!(DocEnrichError::Worker("panicked".into()).class(), "worker");
    }
}
