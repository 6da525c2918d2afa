//! Error types for shellvisor core library.

use thiserror::Error;

/// Result type alias using shellvisor Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for shellvisor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Logging could not be set up
    #[error("Tracing setup failed: {0}")]
    Tracing(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
