//! Shared error types for the Mnemo system.

use thiserror::Error;

/// Top-level error type for the memory ledger.
#[derive(Error, Debug)]
pub enum MnemoError {
    /// The hash chain does not verify, or the ledger tail is not what the caller expected.
    ///
    /// Never repaired automatically.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A concurrent append kept colliding after all retries were spent.
    #[error("Write conflict after {attempts} attempts: {reason}")]
    WriteConflict {
        /// How many attempts were made.
        attempts: u32,
        /// The last underlying failure.
        reason: String,
    },

    /// A block or slot explicitly named by the caller does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The pair classifier could not evaluate a pair; the queue entry is retried.
    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MnemoError {
    /// Whether this error is worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MnemoError::WriteConflict { .. } | MnemoError::ClassifierUnavailable(_)
        )
    }
}

/// Alias for Result with MnemoError.
pub type MnemoResult<T> = Result<T, MnemoError>;
