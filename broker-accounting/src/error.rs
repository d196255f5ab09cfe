//! Accounting errors.

use broker_domain::{AccountId, DomainError, ErrorKind};
use broker_ledger::LedgerError;
use broker_store::StoreError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by balance movements and account administration
#[derive(Debug, Error)]
pub enum AccountingError {
    /// Account does not exist
    #[error("account not found: {0}")]
    NotFound(AccountId),

    /// Debit exceeds `balance + credit_limit`
    #[error("insufficient balance")]
    Insufficient {
        /// Funds available at check time
        available: Decimal,
        /// Amount requested
        requested: Decimal,
    },

    /// Account version moved between read and write
    #[error("data has been modified by another user, please refresh and try again")]
    OptimisticConflict(AccountId),

    /// Amount violates the operation's sign constraint
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Patch or input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entry could not be signed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Storage failure
    #[error(transparent)]
    Store(StoreError),
}

impl AccountingError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountingError::NotFound(_) => ErrorKind::NotFound,
            AccountingError::Insufficient { .. } => ErrorKind::Insufficient,
            AccountingError::OptimisticConflict(_) => ErrorKind::OptimisticConflict,
            AccountingError::InvalidAmount(_) | AccountingError::Validation(_) => {
                ErrorKind::Validation
            },
            AccountingError::Ledger(_) => ErrorKind::TransientIo,
            AccountingError::Store(e) => e.kind(),
        }
    }
}

impl From<DomainError> for AccountingError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InsufficientFunds { available, requested } => {
                Self::Insufficient { available, requested }
            },
            DomainError::InvalidAmount(msg) => Self::InvalidAmount(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for AccountingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => domain.into(),
            other => Self::Store(other),
        }
    }
}

/// Result type for accounting operations
pub type AccountingResult<T> = Result<T, AccountingError>;
