//! Error taxonomy shared by every pipeline stage.
//!
//! Each variant maps to a stable [`ErrorKind`] that is recorded on failed
//! documents and used to decide whether a call may be retried.

use serde::{Deserialize, Serialize};
use tantivy::TantivyError;
use tantivy::directory::error::OpenDirectoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Unsupported document type: {mime}")]
    UnsupportedType { mime: String },

    #[error("Corrupt input: {reason}")]
    CorruptInput { reason: String },

    #[error("Document too large: exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Source '{key}' unavailable: {reason}")]
    SourceUnavailable { key: String, reason: String },

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Embedding rejected: {0}")]
    EmbeddingRejected(String),

    #[error("Backend '{backend}' does not support {capability}")]
    CapabilityUnsupported {
        backend: &'static str,
        capability: &'static str,
    },

    #[error("Collection '{collection}' holds {expected}-dimensional vectors, got {actual}")]
    DimensionalityConflict {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Vector store unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Ingestion already in progress for document '{0}'")]
    IngestionInProgress(String),

    #[error("No targeted collection could be queried: {0}")]
    RetrievalUnavailable(String),

    #[error("Invalid chunking parameters: {0}")]
    InvalidChunking(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error in {backend}: {reason}")]
    Storage {
        backend: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RagResult<T> = Result<T, RagError>;

/// Stable, serializable classification of a [`RagError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedType,
    CorruptInput,
    TooLarge,
    SourceUnavailable,
    EmbeddingUnavailable,
    EmbeddingRejected,
    CapabilityUnsupported,
    DimensionalityConflict,
    BackendUnavailable,
    IngestionInProgress,
    RetrievalUnavailable,
    InvalidChunking,
    InvalidConfig,
    Cancelled,
    Timeout,
    NotFound,
    Storage,
    Io,
    Serialization,
}

impl RagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedType { .. } => ErrorKind::UnsupportedType,
            Self::CorruptInput { .. } => ErrorKind::CorruptInput,
            Self::TooLarge { .. } => ErrorKind::TooLarge,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Self::EmbeddingRejected(_) => ErrorKind::EmbeddingRejected,
            Self::CapabilityUnsupported { .. } => ErrorKind::CapabilityUnsupported,
            Self::DimensionalityConflict { .. } => ErrorKind::DimensionalityConflict,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::IngestionInProgress(_) => ErrorKind::IngestionInProgress,
            Self::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            Self::InvalidChunking(_) => ErrorKind::InvalidChunking,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Serialization,
        }
    }

    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable(_) | Self::BackendUnavailable(_) | Self::Timeout { .. }
        )
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptInput {
            reason: reason.into(),
        }
    }

    pub fn unsupported(mime: impl Into<String>) -> Self {
        Self::UnsupportedType { mime: mime.into() }
    }
}

impl From<TantivyError> for RagError {
    fn from(err: TantivyError) -> Self {
        Self::Storage {
            backend: "tantivy",
            reason: err.to_string(),
        }
    }
}

impl From<OpenDirectoryError> for RagError {
    fn from(err: OpenDirectoryError) -> Self {
        Self::Storage {
            backend: "tantivy",
            reason: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::BackendUnavailable(format!("sqlite: {err}"))
            }
            other => Self::Storage {
                backend: "sqlite",
                reason: other.to_string(),
            },
        }
    }
}
