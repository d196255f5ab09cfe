//! Accounting engine: debit, credit, adjustment, refund and top-up.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use broker_domain::{
    normalize_money, now_millis, Account, AccountFilter, AccountId, AccountPatch, BalanceChange,
    DomainError, LedgerEntry, NewLedgerEntry, TransactionKind, TransactionMeta,
};
use broker_kv::{get_json, keys, set_json, Cache};
use broker_ledger::{to_csv, LedgerQuery, LedgerSigner};
use broker_store::{Page, Store, StoreError, StoreTransaction};

use crate::error::{AccountingError, AccountingResult};

/// Performs balance movements and owns the `user:<id>` cache entries.
pub struct AccountingEngine {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    signer: LedgerSigner,
}

impl AccountingEngine {
    /// Create an engine signing entries with `signer`.
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, signer: LedgerSigner) -> Self {
        Self { store, cache, signer }
    }

    /// The signer used for ledger hashes.
    pub fn signer(&self) -> &LedgerSigner {
        &self.signer
    }

    // =========================================================================
    // Balance movements
    // =========================================================================

    /// Withdraw `amount` (> 0) within `balance + credit_limit`.
    pub async fn debit(
        &self,
        user_id: AccountId,
        amount: Decimal,
        reason: &str,
        meta: &TransactionMeta,
    ) -> AccountingResult<Account> {
        ensure_positive(amount, "debit")?;
        self.run(user_id, reason, meta, |account| account.plan_debit(amount)).await
    }

    /// Debit inside a caller-owned transaction.
    ///
    /// The caller commits and then calls [`invalidate`](Self::invalidate).
    pub async fn debit_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: AccountId,
        amount: Decimal,
        reason: &str,
        meta: &TransactionMeta,
    ) -> AccountingResult<Account> {
        ensure_positive(amount, "debit")?;
        self.apply_in(tx, user_id, reason, meta, |account| account.plan_debit(amount)).await
    }

    /// Deposit `amount` (> 0). No sufficiency check.
    ///
    /// With kind `user_refund` the amount is also taken off `total_consumed`.
    pub async fn credit(
        &self,
        user_id: AccountId,
        amount: Decimal,
        reason: &str,
        meta: &TransactionMeta,
    ) -> AccountingResult<Account> {
        ensure_positive(amount, "credit")?;
        self.run(user_id, reason, meta, |account| account.plan_credit(amount, meta.kind)).await
    }

    /// Administrative adjustment of either sign; zero is rejected.
    pub async fn adjust(
        &self,
        user_id: AccountId,
        amount: Decimal,
        reason: &str,
        meta: &TransactionMeta,
    ) -> AccountingResult<Account> {
        self.run(user_id, reason, meta, |account| account.plan_adjustment(amount)).await
    }

    /// Give money back for a failed task.
    pub async fn refund(
        &self,
        user_id: AccountId,
        amount: Decimal,
        reason: &str,
    ) -> AccountingResult<Account> {
        let meta = TransactionMeta::system(TransactionKind::UserRefund);
        self.credit(user_id, amount, reason, &meta).await
    }

    /// Credit a top-up; `manual` marks one entered by an operator.
    pub async fn topup(
        &self,
        user_id: AccountId,
        amount: Decimal,
        reason: &str,
        operator: &str,
        operator_id: i64,
        manual: bool,
    ) -> AccountingResult<Account> {
        let kind = if manual { TransactionKind::ManualTopup } else { TransactionKind::UserTopup };
        let meta = TransactionMeta::operator(operator, operator_id, kind);
        self.credit(user_id, amount, reason, &meta).await
    }

    async fn run<F>(
        &self,
        user_id: AccountId,
        reason: &str,
        meta: &TransactionMeta,
        plan: F,
    ) -> AccountingResult<Account>
    where
        F: FnOnce(&Account) -> Result<BalanceChange, DomainError> + Send,
    {
        let mut tx = self.store.begin().await?;
        match self.apply_in(tx.as_mut(), user_id, reason, meta, plan).await {
            Ok(account) => {
                tx.commit().await?;
                self.invalidate(user_id).await;
                Ok(account)
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(user_id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            },
        }
    }

    async fn apply_in<F>(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: AccountId,
        reason: &str,
        meta: &TransactionMeta,
        plan: F,
    ) -> AccountingResult<Account>
    where
        F: FnOnce(&Account) -> Result<BalanceChange, DomainError> + Send,
    {
        let mut account =
            tx.lock_account(user_id).await?.ok_or(AccountingError::NotFound(user_id))?;
        let expected_version = account.version;
        let change = plan(&account)?;

        let now = now_millis();
        account.apply_change(&change, now);
        if !tx.update_account(&account, expected_version).await? {
            warn!(user_id, expected_version, "Account version moved, aborting movement");
            return Err(AccountingError::OptimisticConflict(user_id));
        }

        let created_at = next_entry_time(tx.last_ledger_at(user_id).await?, now);
        let mut entry = NewLedgerEntry {
            created_at,
            user_id,
            amount: change.amount,
            balance_before: change.balance_before,
            balance_after: change.balance_after,
            reason: reason.to_string(),
            operator: meta.operator.clone(),
            operator_id: meta.operator_id,
            kind: meta.kind,
            ip: meta.ip.clone(),
            device: meta.device.clone(),
            hash: String::new(),
        };
        entry.hash = self.signer.sign(&entry)?;
        tx.append_ledger(&entry).await?;

        info!(
            user_id,
            kind = %meta.kind,
            amount = %change.amount,
            balance_after = %change.balance_after,
            version = account.version,
            "Balance updated"
        );
        if change.deactivate {
            info!(user_id, "Balance reached zero, account deactivated");
        }
        Ok(account)
    }

    // =========================================================================
    // Account administration
    // =========================================================================

    /// Read an account, preferring the cached snapshot.
    ///
    /// Never use the result to authorise money movement.
    pub async fn find_account(&self, user_id: AccountId) -> AccountingResult<Account> {
        let key = keys::user(user_id);
        match get_json::<Account>(self.cache.as_ref(), &key).await {
            Ok(Some(account)) => {
                debug!(user_id, "Account served from cache");
                return Ok(account);
            },
            Ok(None) => {},
            Err(e) => warn!(user_id, error = %e, "Account cache read failed"),
        }

        let account = self
            .store
            .accounts()
            .find_by_id(user_id)
            .await?
            .ok_or(AccountingError::NotFound(user_id))?;
        if let Err(e) = set_json(self.cache.as_ref(), &key, &account, keys::USER_TTL).await {
            warn!(user_id, error = %e, "Account cache write failed");
        }
        Ok(account)
    }

    /// Apply a sparse patch guarded by `expected_version`.
    pub async fn update_account(
        &self,
        user_id: AccountId,
        patch: &AccountPatch,
        expected_version: i64,
    ) -> AccountingResult<Account> {
        patch.validate()?;
        let updated = self
            .store
            .accounts()
            .apply_update(user_id, patch, expected_version)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => AccountingError::NotFound(user_id),
                StoreError::OptimisticConflict { .. } => {
                    AccountingError::OptimisticConflict(user_id)
                },
                other => other.into(),
            })?;
        self.invalidate(user_id).await;
        info!(user_id, version = updated.version, "Account updated");
        Ok(updated)
    }

    /// Delete an account and its ledger entries.
    pub async fn delete_account(&self, user_id: AccountId) -> AccountingResult<()> {
        self.store.accounts().delete(user_id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => AccountingError::NotFound(user_id),
            other => other.into(),
        })?;
        self.invalidate(user_id).await;
        info!(user_id, "Account deleted");
        Ok(())
    }

    /// Page through accounts, newest first.
    pub async fn list_accounts(&self, filter: &AccountFilter) -> AccountingResult<Page<Account>> {
        Ok(self.store.accounts().list(filter).await?)
    }

    // =========================================================================
    // Ledger reads
    // =========================================================================

    /// Page through ledger entries, newest first.
    pub async fn query_ledger(&self, query: &LedgerQuery) -> AccountingResult<Page<LedgerEntry>> {
        Ok(self.store.ledger().query(query).await?)
    }

    /// CSV of the entries selected by `query`.
    pub async fn export_ledger_csv(&self, query: &LedgerQuery) -> AccountingResult<String> {
        let page = self.query_ledger(query).await?;
        Ok(to_csv(&page.items)?)
    }

    /// Whether a stored entry still matches its hash.
    pub fn verify(&self, entry: &LedgerEntry) -> AccountingResult<bool> {
        Ok(self.signer.verify(entry)?)
    }

    /// Drop the cached snapshot of an account. Failures are logged only.
    pub async fn invalidate(&self, user_id: AccountId) {
        if let Err(e) = self.cache.delete(&keys::user(user_id)).await {
            warn!(user_id, error = %e, "Account cache invalidation failed");
        }
    }
}

fn ensure_positive(amount: Decimal, op: &str) -> AccountingResult<()> {
    if normalize_money(amount) <= Decimal::ZERO {
        return Err(AccountingError::InvalidAmount(format!("{} amount must be positive", op)));
    }
    Ok(())
}

/// Ledger timestamps are strictly increasing per account.
fn next_entry_time(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(last) if last >= now => last + TimeDelta::milliseconds(1),
        _ => now,
    }
}

// =============================================================================
// Tests
// =============================================================================
