use std::time::Duration;

use finops_core::{CoreError, DataError, Retryable};
use thiserror::Error;

use crate::guard::GuardRejection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Timeouts, rate limits, 5xx. Retried with backoff.
    Transient,
    /// Authentication, malformed input, undecodable responses. Surfaced immediately.
    Permanent,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, wait: Option<Duration>) -> Self {
        self.retry_after = wait;
        self
    }
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

#[derive(Error, Debug)]
pub enum RagError {
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error(
        "index is stale (built for dataset {index_hash}, current dataset is {current_hash}); rebuild the index before querying"
    )]
    StaleIndex {
        index_hash: String,
        current_hash: String,
    },
    #[error("index has not been built; run a rebuild first")]
    IndexNotBuilt,
    #[error("index has no entries; rebuild from a non-empty dataset")]
    EmptyIndex,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{0}")]
    GuardRejection(#[from] GuardRejection),
    #[error("index persistence failed: {0}")]
    Persistence(String),
    #[error("index build cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to load source records: {0}")]
    Source(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

impl From<rusqlite::Error> for RagError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<CoreError> for RagError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::Data(err) => Self::Data(err),
            CoreError::Tokenizer(msg) => Self::Config(msg),
            other => Self::Source(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
