//! Broker Domain Layer
//!
//! Pure domain logic with zero I/O dependencies: accounts and their balance
//! arithmetic, ledger entries, generation tasks and their state machine, and
//! the AI model catalogue entries the core reads.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod account;
pub mod ledger;
pub mod model;
pub mod task;
pub mod value_objects;

// Re-export commonly used types
pub use account::{Account, AccountFilter, AccountPatch, BalanceChange, NewAccount, Role};
pub use ledger::{LedgerEntry, NewLedgerEntry, TransactionKind, TransactionMeta};
pub use model::{AiModel, ModelStatus, NewModel};
pub use task::{FailureDisposition, NewTask, Task, TaskFilter, TaskInput, TaskStatus};
pub use value_objects::{
    normalize_money, now_millis, AccountId, DomainError, ErrorKind, LedgerEntryId, ModelId, TaskId,
    DEFAULT_MAX_RETRIES, MONEY_SCALE,
};
