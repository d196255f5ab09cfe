//! PostgreSQL store.
//!
//! Uses dynamic queries (sqlx::query) instead of compile-time checked macros
//! (sqlx::query!) to allow compilation without DATABASE_URL.
//!
//! Account rows are coordinated by `SELECT ... FOR UPDATE` inside a transaction
//! plus a `version` check on every write.

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
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

const ACCOUNT_COLUMNS: &str = "id, username, password_hash, role, balance, credit_limit, \
     total_consumed, version, is_active, activated_at, deactivated_at, created_at, updated_at";

const LEDGER_COLUMNS: &str = "id, created_at, user_id, amount, balance_before, balance_after, \
     reason, operator, operator_id, kind, ip, device, hash";

const TASK_COLUMNS: &str = "id, created_at, updated_at, input, creator_id, creator_name, status, \
     result_url, retry_count, max_retries, error_log, remote_task_id, cost";

const MODEL_COLUMNS: &str = "id, name, url, price, status, created_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!("Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row parsing
// =============================================================================

fn decode_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Deserialization(e.to_string())
}

fn parse_account(row: &PgRow) -> Result<Account, StoreError> {
    let role: String = row.try_get("role")?;
    Ok(Account {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: role.parse().map_err(decode_err)?,
        balance: row.try_get("balance")?,
        credit_limit: row.try_get("credit_limit")?,
        total_consumed: row.try_get("total_consumed")?,
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        activated_at: row.try_get("activated_at")?,
        deactivated_at: row.try_get("deactivated_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_ledger(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        reason: row.try_get("reason")?,
        operator: row.try_get("operator")?,
        operator_id: row.try_get("operator_id")?,
        kind: kind.parse().map_err(decode_err)?,
        ip: row.try_get("ip")?,
        device: row.try_get("device")?,
        hash: row.try_get("hash")?,
    })
}

fn parse_task(row: &PgRow) -> Result<Task, StoreError> {
    let input: serde_json::Value = row.try_get("input")?;
    let status: i16 = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        input: TaskInput::from_value(&input).map_err(decode_err)?,
        creator_id: row.try_get("creator_id")?,
        creator_name: row.try_get("creator_name")?,
        status: TaskStatus::from_code(status).map_err(decode_err)?,
        result_url: row.try_get("result_url")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_log: row.try_get("error_log")?,
        remote_task_id: row.try_get("remote_task_id")?,
        cost: row.try_get("cost")?,
    })
}

fn parse_model(row: &PgRow) -> Result<AiModel, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(AiModel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        price: row.try_get("price")?,
        status: status.parse().map_err(decode_err)?,
        created_at: row.try_get("created_at")?,
    })
}

fn input_json(input: &TaskInput) -> Result<serde_json::Value, StoreError> {
    input.to_value().map_err(|e| StoreError::Serialization(e.to_string()))
}

fn page_bounds(offset: u64, limit: u32) -> (i64, i64) {
    (i64::try_from(offset).unwrap_or(i64::MAX), i64::from(limit))
}

// =============================================================================
// Shared statements (pool or transaction)
// =============================================================================

async fn insert_task_on(conn: &mut PgConnection, task: &NewTask) -> Result<Task, StoreError> {
    let sql = format!(
        "INSERT INTO tasks (input, creator_id, creator_name, status, retry_count, max_retries, cost) \
         VALUES ($1, $2, $3, $4, 0, $5, $6) RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(input_json(&task.input)?)
        .bind(task.creator_id)
        .bind(&task.creator_name)
        .bind(task.status.code())
        .bind(task.max_retries)
        .bind(task.cost)
        .fetch_one(conn)
        .await?;
    parse_task(&row)
}

async fn lock_account_on(
    conn: &mut PgConnection,
    id: AccountId,
) -> Result<Option<Account>, StoreError> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql).bind(id).fetch_optional(conn).await?;
    row.as_ref().map(parse_account).transpose()
}

// =============================================================================
// Accounts
// =============================================================================

fn push_account_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &AccountFilter) {
    qb.push(" WHERE TRUE");
    if let Some(active) = filter.is_active {
        qb.push(" AND is_active = ").push_bind(active);
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at <= ").push_bind(before);
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn create(&self, account: &NewAccount) -> Result<Account, StoreError> {
        let password_hash = hash_password(&account.password).await?;
        let sql = format!(
            "INSERT INTO accounts (username, password_hash, role, balance, credit_limit, is_active, activated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, CASE WHEN $6 THEN now() END) RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&account.username)
            .bind(password_hash)
            .bind(account.role.as_str())
            .bind(account.balance)
            .bind(account.credit_limit)
            .bind(account.is_active)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Duplicate { .. } => StoreError::duplicate("account", &account.username),
                other => other,
            })?;
        parse_account(&row)
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(parse_account).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = $1");
        let row = sqlx::query(&sql).bind(username).fetch_optional(&self.pool).await?;
        row.as_ref().map(parse_account).transpose()
    }

    async fn list(&self, filter: &AccountFilter) -> Result<Page<Account>, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM accounts");
        push_account_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let (offset, limit) = page_bounds(filter.offset(), filter.limit);
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {ACCOUNT_COLUMNS} FROM accounts"));
        push_account_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(parse_account).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
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

        let mut tx = self.pool.begin().await?;
        let mut account = lock_account_on(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found("account", id))?;
        if account.version != expected_version {
            return Err(StoreError::conflict("account", id));
        }

        patch.apply_to(&mut account, Utc::now());
        if let Some(hash) = password_hash {
            account.password_hash = hash;
        }

        let sql = format!(
            "UPDATE accounts SET username = $3, password_hash = $4, role = $5, credit_limit = $6, \
                 is_active = $7, activated_at = $8, deactivated_at = $9, version = $10, updated_at = $11 \
             WHERE id = $1 AND version = $2 RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(&account.username)
            .bind(&account.password_hash)
            .bind(account.role.as_str())
            .bind(account.credit_limit)
            .bind(account.is_active)
            .bind(account.activated_at)
            .bind(account.deactivated_at)
            .bind(account.version)
            .bind(account.updated_at)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::conflict("account", id))?;
        let updated = parse_account(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete(&self, id: AccountId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("account", id));
        }
        Ok(())
    }
}

// =============================================================================
// Ledger
// =============================================================================

fn push_ledger_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &LedgerQuery) {
    qb.push(" WHERE TRUE");
    if let Some(user) = query.user_id {
        qb.push(" AND user_id = ").push_bind(user);
    }
    if let Some(kind) = query.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(from) = query.from_time {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = query.to_time {
        qb.push(" AND created_at <= ").push_bind(to);
    }
    if let Some(min) = query.min_amount {
        qb.push(" AND amount >= ").push_bind(min);
    }
    if let Some(max) = query.max_amount {
        qb.push(" AND amount <= ").push_bind(max);
    }
}

#[async_trait]
impl LedgerRepository for PgStore {
    async fn query(&self, query: &LedgerQuery) -> Result<Page<LedgerEntry>, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ledger_entries");
        push_ledger_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let (offset, limit) = page_bounds(query.offset(), query.limit);
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {LEDGER_COLUMNS} FROM ledger_entries"));
        push_ledger_filters(&mut qb, query);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(parse_ledger).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn find_by_account(&self, user_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE user_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(parse_ledger).collect()
    }
}

// =============================================================================
// Tasks
// =============================================================================

fn push_task_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &TaskFilter) {
    qb.push(" WHERE TRUE");
    if let Some(creator) = filter.creator_id {
        qb.push(" AND creator_id = ").push_bind(creator);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.code());
    }
}

#[async_trait]
impl TaskRepository for PgStore {
    async fn insert(&self, task: &NewTask) -> Result<Task, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_task_on(&mut conn, task).await
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(parse_task).transpose()
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET input = $2, status = $3, result_url = $4, retry_count = $5, max_retries = $6,
                error_log = $7, remote_task_id = $8, cost = $9, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(input_json(&task.input)?)
        .bind(task.status.code())
        .bind(&task.result_url)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.error_log)
        .bind(&task.remote_task_id)
        .bind(task.cost)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", task.id));
        }
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Page<Task>, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tasks");
        push_task_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let (offset, limit) = page_bounds(filter.offset(), filter.limit);
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        push_task_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(parse_task).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let sql =
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .bind(status.code())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_task).collect()
    }

    async fn update_input(&self, id: TaskId, input: &TaskInput) -> Result<Task, StoreError> {
        let sql = format!(
            "UPDATE tasks SET input = $2, updated_at = now() \
             WHERE id = $1 AND status < $3 RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(input_json(input)?)
            .bind(TaskStatus::Processing.code())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => parse_task(&row),
            None => match TaskRepository::find_by_id(self, id).await? {
                Some(task) => Err(StoreError::invalid_state(format!(
                    "task input cannot be changed once processing has started (task {}, status {})",
                    task.id, task.status
                ))),
                None => Err(StoreError::not_found("task", id)),
            },
        }
    }

    async fn set_remote_task_id(
        &self,
        id: TaskId,
        remote_task_id: &str,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE tasks SET remote_task_id = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(remote_task_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1").bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }
}

// =============================================================================
// Models
// =============================================================================

#[async_trait]
impl ModelRepository for PgStore {
    async fn create(&self, model: &NewModel) -> Result<AiModel, StoreError> {
        model.validate()?;
        let sql = format!(
            "INSERT INTO ai_models (name, url, price, status) VALUES ($1, $2, $3, $4) \
             RETURNING {MODEL_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&model.name)
            .bind(&model.url)
            .bind(model.price)
            .bind(model.status.as_str())
            .fetch_one(&self.pool)
            .await?;
        parse_model(&row)
    }

    async fn find_by_id(&self, id: ModelId) -> Result<Option<AiModel>, StoreError> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM ai_models WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(parse_model).transpose()
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<AiModel>, StoreError> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM ai_models WHERE url = $1 ORDER BY id LIMIT 1");
        let row = sqlx::query(&sql).bind(url).fetch_optional(&self.pool).await?;
        row.as_ref().map(parse_model).transpose()
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// A PostgreSQL transaction. Rolled back by sqlx if dropped uncommitted.
pub struct PgStoreTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgStoreTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        lock_account_on(self.conn()?, id).await
    }

    async fn update_account(
        &mut self,
        account: &Account,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $3, total_consumed = $4, is_active = $5, deactivated_at = $6,
                version = $7, updated_at = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(account.id)
        .bind(expected_version)
        .bind(account.balance)
        .bind(account.total_consumed)
        .bind(account.is_active)
        .bind(account.deactivated_at)
        .bind(account.version)
        .bind(account.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn last_ledger_at(
        &mut self,
        user_id: AccountId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM ledger_entries WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(self.conn()?)
                .await?;
        Ok(latest)
    }

    async fn append_ledger(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        let sql = format!(
            "INSERT INTO ledger_entries (created_at, user_id, amount, balance_before, balance_after, \
                 reason, operator, operator_id, kind, ip, device, hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING {LEDGER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(entry.created_at)
            .bind(entry.user_id)
            .bind(entry.amount)
            .bind(entry.balance_before)
            .bind(entry.balance_after)
            .bind(&entry.reason)
            .bind(&entry.operator)
            .bind(entry.operator_id)
            .bind(entry.kind.as_str())
            .bind(&entry.ip)
            .bind(&entry.device)
            .bind(&entry.hash)
            .fetch_one(self.conn()?)
            .await?;
        parse_ledger(&row)
    }

    async fn insert_task(&mut self, task: &NewTask) -> Result<Task, StoreError> {
        insert_task_on(self.conn()?, task).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
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
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction { tx: Some(tx) }))
    }
}
