use std::time::Duration;

use thiserror::Error;

/// Coarse classification attached to every failure value.
///
/// Retry predicates and the circuit breaker branch on this, never on error
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection failure, timeout, or malformed response body.
    Transient,
    /// Upstream reported overload (503/429). Feeds the circuit breaker.
    Overload,
    /// The circuit breaker rejected the call without issuing it.
    CircuitOpen,
    /// Any other non-success HTTP status.
    PermanentHttp,
    /// Payload did not match the expected shape.
    Parse,
    /// Persistence failure.
    Storage,
    /// Bad task reference, URL template, or trigger spec.
    Config,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// True for errors worth retrying at the HTTP or job level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Overload)
    }

    /// True if this error counts toward the circuit breaker threshold.
    pub fn is_overload_signal(&self) -> bool {
        matches!(self, ErrorKind::Overload)
    }
}

/// Application-wide error types for Demeter.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Response body could not be decoded as JSON.
    #[error("Malformed response body: {0}")]
    Decode(String),

    /// Upstream signalled overload (service unavailable / rate limited).
    #[error("Upstream overloaded (HTTP {status})")]
    Overload { status: u16 },

    /// The circuit breaker is open; `retry_after` is the remaining wait.
    #[error("Circuit open, retry after {}s", retry_after.as_secs())]
    CircuitOpen { retry_after: Duration },

    /// Non-retryable HTTP error status.
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// Payload parsing failed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Task id not present in the crawl configuration.
    #[error("Unknown crawl task: {0}")]
    UnknownTask(String),

    /// URL template missing or unresolvable.
    #[error("Config error: {0}")]
    Config(String),

    /// Invalid trigger spec or job definition, raised at registration only.
    #[error("Scheduler config error: {0}")]
    SchedulerConfig(String),

    /// A failed crawl task re-surfaced at the job layer, carrying the
    /// kind of the underlying failure.
    #[error("{message}")]
    Task { message: String, kind: ErrorKind },

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// The explicit classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Network(_) | AppError::Timeout(_) | AppError::Decode(_) => {
                ErrorKind::Transient
            }
            AppError::Overload { .. } => ErrorKind::Overload,
            AppError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AppError::Http { .. } => ErrorKind::PermanentHttp,
            AppError::Parse(_) | AppError::Serialization(_) => ErrorKind::Parse,
            AppError::Storage(_) => ErrorKind::Storage,
            AppError::UnknownTask(_) | AppError::Config(_) | AppError::SchedulerConfig(_) => {
                ErrorKind::Config
            }
            AppError::Task { kind, .. } => *kind,
            AppError::Generic(_) => ErrorKind::Other,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AppError::Network("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::Decode("truncated".into()).is_retryable());
        assert!(AppError::Overload { status: 503 }.is_retryable());
        assert!(
            !AppError::Http {
                status: 404,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(!AppError::Parse("bad shape".into()).is_retryable());
        assert!(!AppError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        // The client waits on the breaker instead of burning retry attempts.
        let err = AppError::CircuitOpen {
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_overload_signal() {
        assert!(AppError::Overload { status: 503 }.kind().is_overload_signal());
        assert!(!AppError::Network("connect".into()).kind().is_overload_signal());
    }

    #[test]
    fn test_task_error_carries_kind() {
        let err = AppError::Task {
            message: "page fetch exhausted".into(),
            kind: ErrorKind::Transient,
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }
}
