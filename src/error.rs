//! Error types for the penalty box.

use thiserror::Error;

/// Main error type for penalty box operations.
///
/// The rate-limit hot path never fails; staleness of a session handle is
/// reported through boolean results. Errors only surface while loading or
/// validating configuration, or when a controller is built without a runtime.
#[derive(Error, Debug)]
pub enum PenaltyBoxError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No tokio runtime available to run the sweep worker
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for penalty box operations.
pub type Result<T> = std::result::Result<T, PenaltyBoxError>;
