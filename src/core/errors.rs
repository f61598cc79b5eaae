use thiserror::Error;
use super::types::{BatchStatus, FileId, FileStatus};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Retry attempts exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: String,
    },

    #[error("File not found: {0}")]
    NotFound(FileId),

    #[error("Cannot {action} while batch is {status}")]
    InvalidState {
        action: &'static str,
        status: BatchStatus,
    },

    #[error("Cannot {action} file {id} in state {status}")]
    InvalidTransition {
        id: FileId,
        action: &'static str,
        status: FileStatus,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Manager shutdown")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// 传输层返回的错误，消息原样写入文件的 `error` 字段
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
