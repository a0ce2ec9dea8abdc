//! Domain error kinds and classification for the pipeline core.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain error kinds recognized by the reliability envelope (retry executor,
/// circuit breaker, orchestrator). These are the kinds a classifier maps an
/// outcome to, not Rust type names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited { retry_after: Option<std::time::Duration> },
    BreakerOpen,
    ServerError { status: u16 },
    AuthError,
    QuotaExhausted,
    InvalidResponse,
    SchemaValidation,
    PersistenceError,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Retryable at item scope: the retry executor should attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimited { .. }
                | ErrorKind::ServerError { .. }
        )
    }

    /// Deferred-retry at batch scope: wait for the breaker's break_duration.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, ErrorKind::BreakerOpen)
    }

    /// Terminal for the item: no further attempts, task moves to Failed and
    /// then possibly Quarantined depending on retry_count.
    pub fn is_terminal_for_item(&self) -> bool {
        matches!(
            self,
            ErrorKind::AuthError | ErrorKind::InvalidResponse | ErrorKind::SchemaValidation
        )
    }

    /// Fatal for the batch: abort rather than continue processing other items.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            ErrorKind::QuotaExhausted | ErrorKind::PersistenceError | ErrorKind::Internal
        )
    }

    /// Whether this failure counts toward tripping a circuit breaker (a
    /// "service" failure, as opposed to a client/validation error).
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::ServerError { .. } => "server_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::SchemaValidation => "schema_validation",
            ErrorKind::PersistenceError => "persistence_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single attempt record, kept so the final surfaced error can include the
/// full attempt history (per the retry executor contract).
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
}

/// Top-level pipeline error. Never carries secrets in its message: callers
/// constructing this from a provider response must redact API keys and
/// `Authorization` headers before building the message string.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: Vec<AttemptRecord>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PersistenceError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::new(ErrorKind::PersistenceError, e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::new(ErrorKind::InvalidResponse, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
