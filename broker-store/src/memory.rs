//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! All tables live behind one async mutex; a transaction holds that mutex for
//! its whole lifetime, so transactions are fully serialised.

use crate::error::StoreError;
use crate::password::hash_password;
use crate::repository::{
    AccountRepository, LedgerRepository, ModelRepository, Page, Store, StoreTransaction,
    TaskRepository,
};
use async_trait::async_trait;
use broker_domain::{
    Account, AccountFilter, AccountId, AccountPatch, AiModel, LedgerEntry, ModelId, NewAccount,
    NewLedgerEntry, NewModel, NewTask, Task, TaskFilter, TaskId, TaskInput, TaskStatus,
};
use broker_ledger::LedgerQuery;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    ledger: Vec<LedgerEntry>,
    tasks: HashMap<TaskId, Task>,
    models: HashMap<ModelId, AiModel>,
}

#[derive(Default)]
struct Sequences {
    account: AtomicI64,
    ledger: AtomicI64,
    task: AtomicI64,
    model: AtomicI64,
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

/// In-memory store for testing
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    seq: Arc<Sequences>,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self { tables: Arc::new(Mutex::new(Tables::default())), seq: Arc::new(Sequences::default()) }
    }

    /// Get the number of accounts
    pub async fn account_count(&self) -> usize {
        self.tables.lock().await.accounts.len()
    }

    /// Get the number of ledger entries
    pub async fn ledger_len(&self) -> usize {
        self.tables.lock().await.ledger.len()
    }

    /// Get the number of tasks
    pub async fn task_count(&self) -> usize {
        self.tables.lock().await.tasks.len()
    }

    /// Clear all data (useful for test setup)
    pub async fn clear(&self) {
        let mut tables = self.tables.lock().await;
        *tables = Tables::default();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, i64)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

// =============================================================================
// Accounts
// =============================================================================

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn create(&self, account: &NewAccount) -> Result<Account, StoreError> {
        let password_hash = hash_password(&account.password).await?;
        let mut tables = self.tables.lock().await;
        if tables.accounts.values().any(|a| a.username == account.username) {
            return Err(StoreError::duplicate("account", &account.username));
        }

        let now = Utc::now();
        let created = Account {
            id: next_id(&self.seq.account),
            username: account.username.clone(),
            password_hash,
            role: account.role,
            balance: account.balance,
            credit_limit: account.credit_limit,
            total_consumed: rust_decimal::Decimal::ZERO,
            version: 1,
            is_active: account.is_active,
            activated_at: account.is_active.then_some(now),
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.lock().await.accounts.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.accounts.values().find(|a| a.username == username).cloned())
    }

    async fn list(&self, filter: &AccountFilter) -> Result<Page<Account>, StoreError> {
        let tables = self.tables.lock().await;
        let mut matching: Vec<Account> =
            tables.accounts.values().filter(|a| filter.matches(a)).cloned().collect();
        newest_first(&mut matching, |a| (a.created_at, a.id));
        Ok(Page::slice(matching, filter.offset(), filter.limit))
    }

    async fn apply_update(
        &self,
        id: AccountId,
        patch: &AccountPatch,
        expected_version: i64,
    ) -> Result<Account, StoreError> {
        patch.validate()?;
        let password_hash = match &patch.password {
            Some(plain) => Some(hash_password(plain).await?),
            None => None,
        };

        let mut tables = self.tables.lock().await;
        if let Some(username) = &patch.username {
            if tables.accounts.values().any(|a| a.id != id && &a.username == username) {
                return Err(StoreError::duplicate("account", username));
            }
        }

        let account =
            tables.accounts.get_mut(&id).ok_or_else(|| StoreError::not_found("account", id))?;
        if account.version != expected_version {
            return Err(StoreError::conflict("account", id));
        }

        patch.apply_to(account, Utc::now());
        if let Some(hash) = password_hash {
            account.password_hash = hash;
        }
        Ok(account.clone())
    }

    async fn delete(&self, id: AccountId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.accounts.remove(&id).is_none() {
            return Err(StoreError::not_found("account", id));
        }
        tables.ledger.retain(|e| e.user_id != id);
        Ok(())
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn query(&self, query: &LedgerQuery) -> Result<Page<LedgerEntry>, StoreError> {
        let tables = self.tables.lock().await;
        let mut matching: Vec<LedgerEntry> =
            tables.ledger.iter().filter(|e| query.matches(e)).cloned().collect();
        newest_first(&mut matching, |e| (e.created_at, e.id));
        Ok(Page::slice(matching, query.offset(), query.limit))
    }

    async fn find_by_account(&self, user_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<LedgerEntry> =
            tables.ledger.iter().filter(|e| e.user_id == user_id).cloned().collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }
}

// =============================================================================
// Tasks
// =============================================================================

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn insert(&self, task: &NewTask) -> Result<Task, StoreError> {
        let created = task.clone().into_task(next_id(&self.seq.task), Utc::now());
        self.tables.lock().await.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tables.lock().await.tasks.get(&id).cloned())
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let stored =
            tables.tasks.get_mut(&task.id).ok_or_else(|| StoreError::not_found("task", task.id))?;
        *stored = Task { updated_at: Utc::now(), ..task.clone() };
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Page<Task>, StoreError> {
        let tables = self.tables.lock().await;
        let mut matching: Vec<Task> =
            tables.tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        newest_first(&mut matching, |t| (t.created_at, t.id));
        Ok(Page::slice(matching, filter.offset(), filter.limit))
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let tables = self.tables.lock().await;
        let mut found: Vec<Task> =
            tables.tasks.values().filter(|t| t.status == status).cloned().collect();
        found.sort_by_key(|t| (t.created_at, t.id));
        Ok(found)
    }

    async fn update_input(&self, id: TaskId, input: &TaskInput) -> Result<Task, StoreError> {
        let mut tables = self.tables.lock().await;
        let task = tables.tasks.get_mut(&id).ok_or_else(|| StoreError::not_found("task", id))?;
        task.replace_input(input.clone())
            .map_err(|e| StoreError::invalid_state(e.to_string()))?;
        Ok(task.clone())
    }

    async fn set_remote_task_id(
        &self,
        id: TaskId,
        remote_task_id: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let task = tables.tasks.get_mut(&id).ok_or_else(|| StoreError::not_found("task", id))?;
        task.remote_task_id = Some(remote_task_id.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        match self.tables.lock().await.tasks.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found("task", id)),
        }
    }
}

// =============================================================================
// Models
// =============================================================================

#[async_trait]
impl ModelRepository for MemoryStore {
    async fn create(&self, model: &NewModel) -> Result<AiModel, StoreError> {
        model.validate()?;
        let created = AiModel {
            id: next_id(&self.seq.model),
            name: model.name.clone(),
            url: model.url.clone(),
            price: model.price,
            status: model.status,
            created_at: Utc::now(),
        };
        self.tables.lock().await.models.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: ModelId) -> Result<Option<AiModel>, StoreError> {
        Ok(self.tables.lock().await.models.get(&id).cloned())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<AiModel>, StoreError> {
        let tables = self.tables.lock().await;
        let mut found: Vec<&AiModel> = tables.models.values().filter(|m| m.url == url).collect();
        found.sort_by_key(|m| m.id);
        Ok(found.first().map(|m| (*m).clone()))
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Transaction over the in-memory tables.
///
/// Writes are staged and applied to the tables on commit.
pub struct MemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    seq: Arc<Sequences>,
    accounts: HashMap<AccountId, Account>,
    ledger: Vec<LedgerEntry>,
    tasks: Vec<Task>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }

    fn current_account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id).or_else(|| self.tables.accounts.get(&id))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.ensure_open()?;
        Ok(self.current_account(id).cloned())
    }

    async fn update_account(
        &mut self,
        account: &Account,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        match self.current_account(account.id) {
            Some(current) if current.version == expected_version => {
                self.accounts.insert(account.id, account.clone());
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn last_ledger_at(
        &mut self,
        user_id: AccountId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .ledger
            .iter()
            .chain(self.ledger.iter())
            .filter(|e| e.user_id == user_id)
            .map(|e| e.created_at)
            .max())
    }

    async fn append_ledger(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.ensure_open()?;
        if self.current_account(entry.user_id).is_none() {
            return Err(StoreError::not_found("account", entry.user_id));
        }
        let stored = entry.clone().into_entry(next_id(&self.seq.ledger));
        self.ledger.push(stored.clone());
        Ok(stored)
    }

    async fn insert_task(&mut self, task: &NewTask) -> Result<Task, StoreError> {
        self.ensure_open()?;
        let created = task.clone().into_task(next_id(&self.seq.task), Utc::now());
        self.tasks.push(created.clone());
        Ok(created)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;

        let accounts = std::mem::take(&mut self.accounts);
        let ledger = std::mem::take(&mut self.ledger);
        let tasks = std::mem::take(&mut self.tasks);

        debug!(
            accounts = accounts.len(),
            ledger = ledger.len(),
            tasks = tasks.len(),
            "Committing memory transaction"
        );
        self.tables.accounts.extend(accounts);
        self.tables.ledger.extend(ledger);
        for task in tasks {
            self.tables.tasks.insert(task.id, task);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        self.accounts.clear();
        self.ledger.clear();
        self.tasks.clear();
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn accounts(&self) -> &dyn AccountRepository {
        self
    }

    fn ledger(&self) -> &dyn LedgerRepository {
        self
    }

    fn tasks(&self) -> &dyn TaskRepository {
        self
    }

    fn models(&self) -> &dyn ModelRepository {
        self
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            tables,
            seq: self.seq.clone(),
            accounts: HashMap::new(),
            ledger: Vec::new(),
            tasks: Vec::new(),
            finished: false,
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
