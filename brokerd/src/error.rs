//! Daemon error types.

use broker_accounting::AccountingError;
use broker_domain::{DomainError, ErrorKind, Task};
use broker_exec::ExecError;
use broker_kv::KvError;
use broker_store::StoreError;
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Accounting error (already carries its own message)
    #[error(transparent)]
    Accounting(#[from] AccountingError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Queue or cache error
    #[error("Queue error: {0}")]
    Kv(#[from] KvError),

    /// Task or model does not exist, or belongs to another user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Submission input is missing a required field
    #[error("{0}")]
    Validation(String),

    /// The task was persisted but its id never reached the queue.
    ///
    /// The task is handed back so the caller can report it.
    #[error("task created but failed to push to queue: {source}")]
    Enqueue {
        /// Persisted task
        task: Box<Task>,
        /// Queue failure
        source: KvError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl DaemonError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Domain(e) => e.kind(),
            DaemonError::Store(e) => e.kind(),
            DaemonError::Accounting(e) => e.kind(),
            DaemonError::Exec(e) => e.kind(),
            DaemonError::Kv(e) => e.kind(),
            DaemonError::NotFound(_) => ErrorKind::NotFound,
            DaemonError::Validation(_) | DaemonError::Config(_) => ErrorKind::Validation,
            DaemonError::Enqueue { .. } | DaemonError::Shutdown => ErrorKind::TransientIo,
        }
    }

    /// The task carried by an `Enqueue` error.
    pub fn created_task(&self) -> Option<&Task> {
        match self {
            DaemonError::Enqueue { task, .. } => Some(task),
            _ => None,
        }
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kinds_pass_through_layers() {
        let insufficient: DaemonError =
            AccountingError::Insufficient { available: dec!(5), requested: dec!(10) }.into();
        assert_eq!(insufficient.kind(), ErrorKind::Insufficient);
        assert_eq!(insufficient.to_string(), "insufficient balance");

        let guard: DaemonError =
            DomainError::InvalidStateTransition("task is not pending audit".into()).into();
        assert_eq!(guard.kind(), ErrorKind::InvalidState);

        let timeout: DaemonError = ExecError::Timeout("task polling timed out".into()).into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let missing = DaemonError::Validation("model_id is required".into());
        assert_eq!(missing.kind(), ErrorKind::Validation);
        assert_eq!(missing.to_string(), "model_id is required");
    }
}
