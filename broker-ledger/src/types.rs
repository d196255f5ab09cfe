//! Ledger error types.

use thiserror::Error;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// HMAC could not be initialised
    #[error("Hash error: {0}")]
    Hash(String),

    /// CSV output could not be written
    #[error("Export error: {0}")]
    Export(#[from] std::io::Error),
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;
