//! Error types for lexbridge.
//!
//! The engine distinguishes definition-time configuration errors (rejected
//! before a workflow is runnable) from connector failures observed during
//! action execution. Connector errors carry enough structure (service,
//! operation, HTTP status) to land verbatim in a workflow log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::ServiceKind;

/// Result type alias for lexbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// lexbridge error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unknown definition content (action type, operator,
    /// cron expression, sort order). Raised at definition time only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Definition failed validation against the workflow invariants.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A connector call failed after the retry policy was exhausted
    /// (or immediately, for non-retryable failures).
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Token acquisition against a connector rate limiter did not
    /// complete within the caller's wait budget. Not retryable at the
    /// dispatch layer; the executor's fail-fast policy applies.
    #[error("Rate limit wait of {waited_ms}ms exhausted for {service}")]
    RateLimitTimeout { service: ServiceKind, waited_ms: u64 },

    /// The overall execution deadline elapsed mid-run.
    #[error("execution timeout after {0}s")]
    ExecutionTimeout(u64),

    /// The per-workflow execution lock was held by a previous run.
    /// Always resolved as a skipped execution, never surfaced as a
    /// hard failure.
    #[error("previous execution still running")]
    LockContention,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for log records and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Connector(_) => "CONNECTOR_ERROR",
            Error::RateLimitTimeout { .. } => "RATE_LIMIT_TIMEOUT",
            Error::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            Error::LockContention => "LOCK_CONTENTION",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the dispatch layer may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connector(e) => e.kind.is_retryable(),
            _ => false,
        }
    }
}

/// Failure classes for connector calls.
///
/// `RateLimited` and `Transient` are retried with backoff by the dispatch
/// layer; the remaining kinds surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    /// HTTP 429.
    RateLimited,
    /// HTTP 401 / 403.
    Unauthorized,
    /// HTTP 404.
    NotFound,
    /// HTTP 5xx or a transport-level failure (connect, timeout).
    Transient,
    /// Any other 4xx: the request itself is wrong and will not heal.
    Malformed,
}

impl ConnectorErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            401 | 403 => Self::Unauthorized,
            404 => Self::NotFound,
            s if s >= 500 => Self::Transient,
            _ => Self::Malformed,
        }
    }
}

impl std::fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NotFound => write!(f, "not_found"),
            Self::Transient => write!(f, "transient"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// A failed call against one of the external services.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{service} {operation} failed ({kind}{}): {message}", status.map(|s| format!(", HTTP {s}")).unwrap_or_default())]
pub struct ConnectorError {
    /// Which service the call targeted.
    pub service: ServiceKind,
    /// Capability-level operation name (e.g. "create voucher").
    pub operation: String,
    /// HTTP status, when the service responded at all.
    pub status: Option<u16>,
    pub kind: ConnectorErrorKind,
    pub message: String,
}

impl ConnectorError {
    pub fn new(
        service: ServiceKind,
        operation: impl Into<String>,
        kind: ConnectorErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service,
            operation: operation.into(),
            status: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Build from an HTTP response status and body excerpt.
    pub fn from_response(
        service: ServiceKind,
        operation: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self {
            service,
            operation: operation.into(),
            status: Some(status),
            kind: ConnectorErrorKind::from_status(status),
            message: body.into(),
        }
    }

    /// Build from a transport-level reqwest failure (no response).
    pub fn from_transport(
        service: ServiceKind,
        operation: impl Into<String>,
        err: &reqwest::Error,
    ) -> Self {
        Self {
            service,
            operation: operation.into(),
            status: None,
            kind: ConnectorErrorKind::Transient,
            message: err.to_string(),
        }
    }
}
