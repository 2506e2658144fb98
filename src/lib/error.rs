use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReadHistoryError>;

#[derive(Debug, Error)]
pub enum ReadHistoryError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("index `{0}` is not enabled")]
    UnknownIndex(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("notification error: {0}")]
    Notification(String),
}

impl ReadHistoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Errors the caller cannot fix by retrying the same input.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidCursor(_) | Self::UnknownIndex(_)
        )
    }
}

impl From<rocksdb::Error> for ReadHistoryError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for ReadHistoryError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for ReadHistoryError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ReadHistoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
