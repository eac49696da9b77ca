//! Error types for mysql-replay
//!
//! This module defines the main error type used throughout the crate and the
//! crate-wide `Result` alias. Database-level errors live in [`crate::db`]
//! because the replay worker needs to classify them by kind.

use thiserror::Error;

/// Result type alias for mysql-replay operations
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Invalid DSN: {0}")]
    Dsn(String),

    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote agent error: {0}")]
    Remote(String),
}

impl ReplayError {
    /// Build a codec error from anything displayable
    pub fn codec(msg: impl Into<String>) -> Self {
        ReplayError::Codec(msg.into())
    }

    /// Build an event encode/decode error
    pub fn event(msg: impl Into<String>) -> Self {
        ReplayError::Event(msg.into())
    }

    /// Build a capture pipeline error
    pub fn capture(msg: impl Into<String>) -> Self {
        ReplayError::Capture(msg.into())
    }

    /// Build a replay pipeline error
    pub fn replay(msg: impl Into<String>) -> Self {
        ReplayError::Replay(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReplayError::codec("truncated frame");
        assert_eq!(err.to_string(), "Codec error: truncated frame");

        let err = ReplayError::Dsn("missing tcp(...) block".to_string());
        assert!(err.to_string().contains("missing tcp"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: ReplayError = io.into();
        assert!(matches!(err, ReplayError::Io(_)));
    }
}
