//! Common error types for BVM

use thiserror::Error;

/// Common result type for BVM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across BVM services
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Event payload did not match the shape required by its kind
    #[error("Invalid event payload for {kind}: {reason}")]
    EventPayload { kind: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
