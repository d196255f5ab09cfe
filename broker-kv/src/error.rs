//! Queue and cache errors.

use broker_domain::ErrorKind;
use thiserror::Error;

/// Errors raised by queue and cache backends
#[derive(Debug, Error)]
pub enum KvError {
    /// Backend unreachable
    #[error("KV connection error: {0}")]
    Connection(String),

    /// Backend rejected a command
    #[error("KV command error: {0}")]
    Command(String),

    /// Value could not be encoded or decoded
    #[error("KV serialization error: {0}")]
    Serialization(String),
}

impl KvError {
    /// Queue and cache failures are always retry-safe.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransientIo
    }
}

/// Result type for queue and cache operations
pub type KvResult<T> = Result<T, KvError>;
