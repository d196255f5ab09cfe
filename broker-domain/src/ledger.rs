//! Ledger entries: the append-only record of every balance movement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::value_objects::{AccountId, DomainError, LedgerEntryId};

/// Why a balance moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Arbitrary administrative adjustment
    AdminAdjustment,
    /// Automatic system movement
    SystemAuto,
    /// Charge for a submitted task
    UserConsume,
    /// Refund of a failed task
    UserRefund,
    /// Payment-gateway top-up
    UserTopup,
    /// Manually completed top-up order
    ManualTopup,
}

impl TransactionKind {
    /// Storage and hash representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::AdminAdjustment => "admin_adjustment",
            TransactionKind::SystemAuto => "system_auto",
            TransactionKind::UserConsume => "user_consume",
            TransactionKind::UserRefund => "user_refund",
            TransactionKind::UserTopup => "user_topup",
            TransactionKind::ManualTopup => "manual_topup",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin_adjustment" => Ok(TransactionKind::AdminAdjustment),
            "system_auto" => Ok(TransactionKind::SystemAuto),
            "user_consume" => Ok(TransactionKind::UserConsume),
            "user_refund" => Ok(TransactionKind::UserRefund),
            "user_topup" => Ok(TransactionKind::UserTopup),
            "manual_topup" => Ok(TransactionKind::ManualTopup),
            other => Err(DomainError::unknown("transaction kind", other)),
        }
    }
}

/// Who caused a balance movement, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMeta {
    /// Operator display name
    pub operator: String,
    /// Operator account id (0 = system)
    pub operator_id: i64,
    /// Movement kind
    pub kind: TransactionKind,
    /// Client IP, if known
    pub ip: String,
    /// Client device description, if known
    pub device: String,
}

impl TransactionMeta {
    /// Movement performed by the system itself.
    pub fn system(kind: TransactionKind) -> Self {
        Self {
            operator: "system".to_string(),
            operator_id: 0,
            kind,
            ip: String::new(),
            device: String::new(),
        }
    }

    /// Movement performed by a named operator.
    pub fn operator(name: impl Into<String>, operator_id: i64, kind: TransactionKind) -> Self {
        Self {
            operator: name.into(),
            operator_id,
            kind,
            ip: String::new(),
            device: String::new(),
        }
    }

    /// Attach client IP and device information.
    pub fn with_client(mut self, ip: impl Into<String>, device: impl Into<String>) -> Self {
        self.ip = ip.into();
        self.device = device.into();
        self
    }
}

/// A ledger entry before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    /// Creation time (millisecond precision)
    pub created_at: DateTime<Utc>,
    /// Account the entry belongs to
    pub user_id: AccountId,
    /// Signed amount
    pub amount: Decimal,
    /// Balance before
    pub balance_before: Decimal,
    /// Balance after
    pub balance_after: Decimal,
    /// Free-text reason
    pub reason: String,
    /// Operator display name
    pub operator: String,
    /// Operator id (0 = system)
    pub operator_id: i64,
    /// Movement kind
    pub kind: TransactionKind,
    /// Client IP
    pub ip: String,
    /// Client device
    pub device: String,
    /// Tamper-evidence HMAC (hex)
    pub hash: String,
}

impl NewLedgerEntry {
    /// Attach the id assigned by the store.
    pub fn into_entry(self, id: LedgerEntryId) -> LedgerEntry {
        LedgerEntry {
            id,
            created_at: self.created_at,
            user_id: self.user_id,
            amount: self.amount,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            reason: self.reason,
            operator: self.operator,
            operator_id: self.operator_id,
            kind: self.kind,
            ip: self.ip,
            device: self.device,
            hash: self.hash,
        }
    }
}

/// A persisted ledger entry.
///
/// # Invariants
/// - `balance_after == balance_before + amount`
/// - never mutated once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id
    pub id: LedgerEntryId,
    /// Creation time (millisecond precision)
    pub created_at: DateTime<Utc>,
    /// Account the entry belongs to
    pub user_id: AccountId,
    /// Signed amount
    pub amount: Decimal,
    /// Balance before
    pub balance_before: Decimal,
    /// Balance after
    pub balance_after: Decimal,
    /// Free-text reason
    pub reason: String,
    /// Operator display name
    pub operator: String,
    /// Operator id (0 = system)
    pub operator_id: i64,
    /// Movement kind
    pub kind: TransactionKind,
    /// Client IP
    pub ip: String,
    /// Client device
    pub device: String,
    /// Tamper-evidence HMAC (hex)
    pub hash: String,
}

impl LedgerEntry {
    /// Whether `balance_after == balance_before + amount`.
    pub fn is_balanced(&self) -> bool {
        self.balance_after == self.balance_before + self.amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_storage_string() {
        for kind in [
            TransactionKind::AdminAdjustment,
            TransactionKind::SystemAuto,
            TransactionKind::UserConsume,
            TransactionKind::UserRefund,
            TransactionKind::UserTopup,
            TransactionKind::ManualTopup,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
        assert!("bonus".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn test_system_meta() {
        let meta = TransactionMeta::system(TransactionKind::UserRefund);
        assert_eq!(meta.operator, "system");
        assert_eq!(meta.operator_id, 0);
    }
}
