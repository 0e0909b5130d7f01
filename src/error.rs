//! Error types for Tollgate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected before touching the store: bad limit, window, identifier or algorithm
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The shared store failed or did not answer in time
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from the shared store rather than the caller's input.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, TollgateError::Store(_))
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
