//! Error types and Result alias for the realtime layer

use thiserror::Error;

/// Main error type for the realtime layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid room key: {0}")]
    InvalidRoom(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message {id} cannot be retried while {status}")]
    NotRetryable { id: String, status: String },
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}
