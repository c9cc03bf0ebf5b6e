//! Error types for polarway-ingest

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Network failure, timeout, server-side error or explicit rate limiting.
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: String,
    },

    /// The source rejected the request outright (bad credentials, malformed request, ...).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Non-advancing cursor, malformed page info or an unparseable response shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transform failed for {identity} at record #{sequence}: {message}")]
    Transform {
        identity: String,
        sequence: u64,
        message: String,
    },

    #[error("Failed to commit collector state for {identity}: {message}")]
    StateCommit {
        identity: String,
        message: String,
    },

    #[error("Run failed for {identity} at {location}: {source}")]
    RunFailed {
        identity: String,
        location: String,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Run canceled for {identity}")]
    Canceled { identity: String },

    #[error("Run deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, IngestError::Canceled { .. })
    }

    /// The innermost error, looking through `RunFailed` wrappers.
    pub fn root_cause(&self) -> &IngestError {
        match self {
            IngestError::RunFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Outcome classification of a single fetch attempt, consumed by the retry layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{0}")]
    Transient(String),

    #[error("rate limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{0}")]
    Permanent(String),

    #[error("{0}")]
    Protocol(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::RateLimited { .. })
    }
}

impl From<FetchError> for IngestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => IngestError::TransientFetch(msg),
            FetchError::RateLimited { .. } => IngestError::TransientFetch(err.to_string()),
            FetchError::Permanent(msg) => IngestError::Rejected(msg),
            FetchError::Protocol(msg) => IngestError::Protocol(msg),
        }
    }
}
