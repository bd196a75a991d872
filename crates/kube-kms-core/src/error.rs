use std::time::Duration;

use thiserror::Error;

/// Coarse error classes reported to the API server and used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigInvalid,
    BackendUnavailable,
    BackendRejected,
    KeyNotFound,
    DeadlineExceeded,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::KeyNotFound => "key_not_found",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum KmsError {
    // Startup
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    // Backend
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend rejected the operation: {0}")]
    BackendRejected(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    // Caller
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),
}

impl KmsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KmsError::ConfigInvalid(_) | KmsError::TomlDe(_) => ErrorKind::ConfigInvalid,
            KmsError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            KmsError::BackendRejected(_) => ErrorKind::BackendRejected,
            KmsError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            KmsError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            KmsError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            KmsError::Io(_) | KmsError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures an idempotent caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnavailable | ErrorKind::DeadlineExceeded
        )
    }
}

pub type Result<T> = std::result::Result<T, KmsError>;
