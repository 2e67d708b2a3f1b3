//! Error types for Tollgate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cost that is negative, NaN or infinite
    #[error("Invalid cost: {0}")]
    InvalidCost(f64),

    /// The bucket store failed (connection, timeout, protocol)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A bounded retry policy ran out of attempts on a hot key
    #[error("Bucket {key} still contended after {attempts} attempts")]
    Contended { key: String, attempts: u32 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
