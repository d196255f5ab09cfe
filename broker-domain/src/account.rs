//! Accounts and the balance arithmetic the accounting engine applies to them.
//!
//! The functions here only compute outcomes. Persisting them under the
//! optimistic version lock is the job of the store and accounting layers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ledger::TransactionKind;
use crate::value_objects::{normalize_money, AccountId, DomainError};

// =============================================================================
// Role
// =============================================================================

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular end user
    User,
    /// Administrator
    Admin,
}

impl Role {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(DomainError::unknown("role", other)),
        }
    }
}

// =============================================================================
// Account
// =============================================================================

/// A user account carrying a balance and a credit line.
///
/// # Invariants
/// - `version` strictly increases on every write
/// - `balance + credit_limit >= 0` right after any debit (debt is otherwise allowed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier
    pub id: AccountId,
    /// Unique login name
    pub username: String,
    /// bcrypt hash of the password
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// Role
    pub role: Role,
    /// Signed balance (8 fractional digits)
    pub balance: Decimal,
    /// Non-negative credit line
    pub credit_limit: Decimal,
    /// Total amount consumed over the account's life
    pub total_consumed: Decimal,
    /// Optimistic lock version
    pub version: i64,
    /// Whether the account may be used
    pub is_active: bool,
    /// Last activation time
    pub activated_at: Option<DateTime<Utc>>,
    /// Last deactivation time
    pub deactivated_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a balance operation, computed before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    /// Signed amount recorded in the ledger
    pub amount: Decimal,
    /// Balance before the change
    pub balance_before: Decimal,
    /// Balance after the change
    pub balance_after: Decimal,
    /// total_consumed after the change
    pub total_consumed_after: Decimal,
    /// Whether the account must be deactivated (balance landed exactly on zero)
    pub deactivate: bool,
}

impl Account {
    /// Funds a single debit may withdraw: `balance + credit_limit`.
    pub fn available_funds(&self) -> Decimal {
        self.balance + self.credit_limit
    }

    /// Compute a debit of `amount` (must be positive).
    ///
    /// # Errors
    /// - `InvalidAmount` if `amount <= 0`
    /// - `InsufficientFunds` if available funds are below `amount`
    pub fn plan_debit(&self, amount: Decimal) -> Result<BalanceChange, DomainError> {
        let amount = normalize_money(amount);
        if amount <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount("debit amount must be positive".to_string()));
        }

        let available = self.available_funds();
        if available < amount {
            return Err(DomainError::InsufficientFunds { available, requested: amount });
        }

        Ok(BalanceChange {
            amount: -amount,
            balance_before: self.balance,
            balance_after: self.balance - amount,
            total_consumed_after: self.total_consumed + amount,
            deactivate: false,
        })
    }

    /// Compute a credit of `amount` (must be positive).
    ///
    /// Refunds give back consumption: `total_consumed` is reduced by the
    /// refunded amount without clamping.
    pub fn plan_credit(
        &self,
        amount: Decimal,
        kind: TransactionKind,
    ) -> Result<BalanceChange, DomainError> {
        let amount = normalize_money(amount);
        if amount <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount("credit amount must be positive".to_string()));
        }

        let total_consumed_after = if kind == TransactionKind::UserRefund {
            self.total_consumed - amount
        } else {
            self.total_consumed
        };

        Ok(self.settle(amount, total_consumed_after))
    }

    /// Compute an administrative adjustment (any non-zero sign).
    ///
    /// A negative adjustment counts as consumption.
    pub fn plan_adjustment(&self, amount: Decimal) -> Result<BalanceChange, DomainError> {
        let amount = normalize_money(amount);
        if amount.is_zero() {
            return Err(DomainError::InvalidAmount("adjustment amount must be non-zero".to_string()));
        }

        let total_consumed_after = if amount.is_sign_negative() {
            self.total_consumed + amount.abs()
        } else {
            self.total_consumed
        };

        Ok(self.settle(amount, total_consumed_after))
    }

    fn settle(&self, amount: Decimal, total_consumed_after: Decimal) -> BalanceChange {
        let balance_after = self.balance + amount;
        BalanceChange {
            amount,
            balance_before: self.balance,
            balance_after,
            total_consumed_after,
            deactivate: balance_after.is_zero(),
        }
    }

    /// Apply a computed change in place and bump the version.
    pub fn apply_change(&mut self, change: &BalanceChange, now: DateTime<Utc>) {
        self.balance = change.balance_after;
        self.total_consumed = change.total_consumed_after;
        if change.deactivate {
            self.is_active = false;
            self.deactivated_at = Some(now);
        }
        self.version += 1;
        self.updated_at = now;
    }
}

// =============================================================================
// Creation, patch and filter
// =============================================================================

/// Data required to create an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Unique login name
    pub username: String,
    /// Plain-text password; hashed by the store
    pub password: String,
    /// Role
    pub role: Role,
    /// Opening balance
    pub balance: Decimal,
    /// Credit line
    pub credit_limit: Decimal,
    /// Initial active flag
    pub is_active: bool,
}

impl NewAccount {
    /// A regular, active account with the given opening balance and credit line.
    pub fn user(username: impl Into<String>, balance: Decimal, credit_limit: Decimal) -> Self {
        Self {
            username: username.into(),
            password: String::new(),
            role: Role::User,
            balance,
            credit_limit,
            is_active: true,
        }
    }

    /// Set the plain-text password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

/// Sparse update applied by `apply_update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    /// New username
    pub username: Option<String>,
    /// New plain-text password (hashed before write)
    pub password: Option<String>,
    /// New role
    pub role: Option<Role>,
    /// New credit limit
    pub credit_limit: Option<Decimal>,
    /// Activate (stamps `activated_at`) or deactivate (stamps `deactivated_at`)
    pub is_active: Option<bool>,
}

impl AccountPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.role.is_none()
            && self.credit_limit.is_none()
            && self.is_active.is_none()
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(limit) = self.credit_limit {
            if limit.is_sign_negative() {
                return Err(DomainError::InvalidAmount(
                    "credit limit must be non-negative".to_string(),
                ));
            }
        }
        if let Some(name) = &self.username {
            if name.trim().is_empty() {
                return Err(DomainError::InvalidInput("username must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Apply non-secret fields to an account, stamping activation timestamps.
    ///
    /// The password is not touched here; the store hashes and writes it.
    pub fn apply_to(&self, account: &mut Account, now: DateTime<Utc>) {
        if let Some(username) = &self.username {
            account.username = username.clone();
        }
        if let Some(role) = self.role {
            account.role = role;
        }
        if let Some(limit) = self.credit_limit {
            account.credit_limit = normalize_money(limit);
        }
        if let Some(active) = self.is_active {
            account.is_active = active;
            if active {
                account.activated_at = Some(now);
                account.deactivated_at = None;
            } else {
                account.deactivated_at = Some(now);
            }
        }
        account.version += 1;
        account.updated_at = now;
    }
}

/// Listing filter for accounts.
#[derive(Debug, Clone)]
pub struct AccountFilter {
    /// Only accounts with this active flag
    pub is_active: Option<bool>,
    /// Created at or after
    pub created_after: Option<DateTime<Utc>>,
    /// Created at or before
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub limit: u32,
}

impl Default for AccountFilter {
    fn default() -> Self {
        Self { is_active: None, created_after: None, created_before: None, page: 1, limit: 20 }
    }
}

impl AccountFilter {
    /// Row offset for the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }

    /// Whether an account passes the non-paging criteria.
    pub fn matches(&self, account: &Account) -> bool {
        self.is_active.map_or(true, |a| account.is_active == a)
            && self.created_after.map_or(true, |t| account.created_at >= t)
            && self.created_before.map_or(true, |t| account.created_at <= t)
    }
}
