//! Value objects and primitive aliases for the broker domain.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rust_decimal::Decimal;

/// Identifier of an account row.
pub type AccountId = i64;
/// Identifier of a task row.
pub type TaskId = i64;
/// Identifier of an AI model row.
pub type ModelId = i64;
/// Identifier of a ledger entry.
pub type LedgerEntryId = i64;

/// Number of fractional digits carried by every money value.
pub const MONEY_SCALE: u32 = 8;

/// Retry budget given to freshly submitted tasks.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Round a money value to the fixed 8-digit scale.
pub fn normalize_money(value: Decimal) -> Decimal {
    value.round_dp(MONEY_SCALE)
}

/// Current time truncated to millisecond precision.
///
/// Ledger timestamps are stored with millisecond precision; truncating before
/// hashing keeps the stored hash reproducible after a database round-trip.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}

/// Domain errors for validation and state-machine guards
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Amount must satisfy the operation's sign constraint
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Debit would leave the account below its credit limit
    #[error("insufficient balance")]
    InsufficientFunds {
        /// balance + credit_limit at the time of the check
        available: Decimal,
        /// Amount the caller asked to withdraw
        requested: Decimal,
    },

    /// Task state machine rejected a transition
    #[error("{0}")]
    InvalidStateTransition(String),

    /// Task input is malformed or missing required fields
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown enum discriminant read from storage
    #[error("Unknown {kind}: {value}")]
    UnknownVariant {
        /// Enum being parsed
        kind: &'static str,
        /// Raw value that failed to parse
        value: String,
    },
}

impl DomainError {
    pub(crate) fn unknown(kind: &'static str, value: impl ToString) -> Self {
        Self::UnknownVariant { kind, value: value.to_string() }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::InvalidAmount(_) | DomainError::InvalidInput(_) => ErrorKind::Validation,
            DomainError::InsufficientFunds { .. } => ErrorKind::Insufficient,
            DomainError::InvalidStateTransition(_) => ErrorKind::InvalidState,
            DomainError::UnknownVariant { .. } => ErrorKind::TransientIo,
        }
    }
}

/// Coarse error classification shared by every layer.
///
/// Callers branch on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Target does not exist
    NotFound,
    /// Debit would break available funds
    Insufficient,
    /// Version mismatch
    OptimisticConflict,
    /// State machine guard rejected the transition
    InvalidState,
    /// Input missing required fields or malformed
    Validation,
    /// Database, queue or HTTP failure that is safe to retry
    TransientIo,
    /// Third party reported a terminal failure
    RemoteFailure,
    /// Executor budget exceeded
    Timeout,
}

impl ErrorKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Insufficient => "insufficient",
            ErrorKind::OptimisticConflict => "optimistic_conflict",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Validation => "validation",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::RemoteFailure => "remote_failure",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
