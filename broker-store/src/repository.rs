//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the broker core.
//! Implementations can be PostgreSQL or in-memory for testing.

use crate::error::StoreError;
use async_trait::async_trait;
use broker_domain::{
    Account, AccountFilter, AccountId, AccountPatch, AiModel, LedgerEntry, ModelId, NewAccount,
    NewLedgerEntry, NewModel, NewTask, Task, TaskFilter, TaskId, TaskInput, TaskStatus,
};
use broker_ledger::LedgerQuery;
use chrono::{DateTime, Utc};

/// One page of a listing plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Rows of the requested page
    pub items: Vec<T>,
    /// Total rows matching the filter
    pub total: u64,
}

impl<T> Page<T> {
    /// Apply offset/limit to an already filtered and ordered list.
    pub fn slice(all: Vec<T>, offset: u64, limit: u32) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect();
        Self { items, total }
    }
}

/// Repository for accounts
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Create an account (password hashed before write)
    async fn create(&self, account: &NewAccount) -> Result<Account, StoreError>;

    /// Find an account by ID
    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Find an account by username
    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError>;

    /// List accounts, newest first
    async fn list(&self, filter: &AccountFilter) -> Result<Page<Account>, StoreError>;

    /// Apply a sparse patch if the stored version still equals `expected_version`.
    ///
    /// Errors with `NotFound` or `OptimisticConflict`.
    async fn apply_update(
        &self,
        id: AccountId,
        patch: &AccountPatch,
        expected_version: i64,
    ) -> Result<Account, StoreError>;

    /// Delete an account together with its ledger entries
    async fn delete(&self, id: AccountId) -> Result<(), StoreError>;
}

/// Read side of the ledger. Entries are appended only through
/// [`StoreTransaction::append_ledger`] and are never updated.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Paginated query, newest first
    async fn query(&self, query: &LedgerQuery) -> Result<Page<LedgerEntry>, StoreError>;

    /// Every entry of one account, oldest first
    async fn find_by_account(&self, user_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// Repository for tasks
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a task outside any financial transaction
    async fn insert(&self, task: &NewTask) -> Result<Task, StoreError>;

    /// Find a task by ID
    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Persist every mutable field of a task
    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    /// List tasks, newest first
    async fn list(&self, filter: &TaskFilter) -> Result<Page<Task>, StoreError>;

    /// All tasks in `status`, oldest first
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

    /// All tasks in `Processing`, oldest first
    async fn find_stuck(&self) -> Result<Vec<Task>, StoreError> {
        self.find_by_status(TaskStatus::Processing).await
    }

    /// Replace the input; `InvalidState` once the task reached `Processing`
    async fn update_input(&self, id: TaskId, input: &TaskInput) -> Result<Task, StoreError>;

    /// Record the provider's identifier without touching other fields
    async fn set_remote_task_id(&self, id: TaskId, remote_task_id: &str)
        -> Result<(), StoreError>;

    /// Delete a task
    async fn delete(&self, id: TaskId) -> Result<(), StoreError>;
}

/// Repository for AI models (read by the core, written by admin tooling)
#[async_trait]
pub trait ModelRepository: Send + Sync {
    /// Register a model
    async fn create(&self, model: &NewModel) -> Result<AiModel, StoreError>;

    /// Find a model by ID
    async fn find_by_id(&self, id: ModelId) -> Result<Option<AiModel>, StoreError>;

    /// Find a model by its endpoint URL
    async fn find_by_url(&self, url: &str) -> Result<Option<AiModel>, StoreError>;
}

/// A unit of work spanning accounts, ledger and tasks.
///
/// Dropping a transaction without calling `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Load an account and hold its row lock until the transaction ends
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Write balance fields if the stored version equals `expected_version`.
    ///
    /// Returns `false` when no row matched (version moved).
    async fn update_account(
        &mut self,
        account: &Account,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// Creation time of the newest ledger entry of an account
    async fn last_ledger_at(
        &mut self,
        user_id: AccountId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Append a ledger entry
    async fn append_ledger(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    /// Insert a task
    async fn insert_task(&mut self, task: &NewTask) -> Result<Task, StoreError>;

    /// Make every write visible
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard every write
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Combined store interface
#[async_trait]
pub trait Store: Send + Sync {
    /// Get account repository
    fn accounts(&self) -> &dyn AccountRepository;

    /// Get ledger repository
    fn ledger(&self) -> &dyn LedgerRepository;

    /// Get task repository
    fn tasks(&self) -> &dyn TaskRepository;

    /// Get model repository
    fn models(&self) -> &dyn ModelRepository;

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}
