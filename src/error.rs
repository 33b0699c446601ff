use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("format error: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, ReaderError>;

impl ReaderError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }
}

impl From<serde_json::Error> for ReaderError {
    fn from(value: serde_json::Error) -> Self {
        ReaderError::Format(value.to_string())
    }
}

impl From<reqwest::Error> for ReaderError {
    fn from(value: reqwest::Error) -> Self {
        ReaderError::Network(value.to_string())
    }
}

impl From<url::ParseError> for ReaderError {
    fn from(value: url::ParseError) -> Self {
        ReaderError::NotFound(format!("invalid source reference: {}", value))
    }
}

impl From<rusqlite::Error> for ReaderError {
    fn from(value: rusqlite::Error) -> Self {
        ReaderError::Io(io::Error::new(io::ErrorKind::Other, value))
    }
}

impl From<tempfile::PersistError> for ReaderError {
    fn from(value: tempfile::PersistError) -> Self {
        ReaderError::Io(value.error)
    }
}
