//! Execution layer error types.

use broker_domain::ErrorKind;
use thiserror::Error;

/// Errors that can occur while running a task.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Input lacks a field the executor needs
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No executor registered under this name
    #[error("Unknown executor: {0}")]
    UnknownExecutor(String),

    /// Transport-level HTTP failure
    #[error("request failed: {0}")]
    Request(String),

    /// Provider answered with an error status
    #[error("api returned error status: {status}, body: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Provider answered with something that is not the expected JSON
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Provider reported a terminal failure
    #[error("{0}")]
    RemoteFailed(String),

    /// Provider reported success without an artifact URL
    #[error("{0}")]
    MissingResult(String),

    /// Budget exceeded
    #[error("{0}")]
    Timeout(String),

    /// Artifact download failed
    #[error("failed to download file: {0}")]
    Download(String),

    /// Artifact upload failed
    #[error("failed to upload to oss: {0}")]
    Upload(String),

    /// Local filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] broker_store::StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] broker_domain::DomainError),

    /// Hook rejected the result
    #[error("Hook error: {0}")]
    Hook(String),
}

impl ExecError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::InvalidInput(_) | ExecError::UnknownExecutor(_) => ErrorKind::Validation,
            ExecError::RemoteFailed(_) | ExecError::MissingResult(_) | ExecError::Api { .. } => {
                ErrorKind::RemoteFailure
            },
            ExecError::Timeout(_) => ErrorKind::Timeout,
            ExecError::Store(e) => e.kind(),
            ExecError::Domain(e) => e.kind(),
            ExecError::Request(_)
            | ExecError::Decode(_)
            | ExecError::Download(_)
            | ExecError::Upload(_)
            | ExecError::Io(_)
            | ExecError::Hook(_) => ErrorKind::TransientIo,
        }
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
