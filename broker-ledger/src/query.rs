//! Ledger querying

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use broker_domain::{AccountId, LedgerEntry, TransactionKind};

/// Query options for reading ledger entries.
///
/// Results are always ordered by creation time, newest first.
#[derive(Debug, Clone)]
pub struct LedgerQuery {
    /// Filter by account
    pub user_id: Option<AccountId>,

    /// Filter by movement kind
    pub kind: Option<TransactionKind>,

    /// Start time (inclusive)
    pub from_time: Option<DateTime<Utc>>,

    /// End time (inclusive)
    pub to_time: Option<DateTime<Utc>>,

    /// Minimum signed amount (inclusive)
    pub min_amount: Option<Decimal>,

    /// Maximum signed amount (inclusive)
    pub max_amount: Option<Decimal>,

    /// 1-based page number
    pub page: u32,

    /// Page size
    pub limit: u32,
}

impl Default for LedgerQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerQuery {
    /// All entries, first page of 20.
    pub fn new() -> Self {
        Self {
            user_id: None,
            kind: None,
            from_time: None,
            to_time: None,
            min_amount: None,
            max_amount: None,
            page: 1,
            limit: 20,
        }
    }

    /// Filter by account
    pub fn user(mut self, user_id: AccountId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Filter by kind
    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filter by time range
    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from_time = Some(from);
        self.to_time = Some(to);
        self
    }

    /// Filter by amount range
    pub fn amount_range(mut self, min: Decimal, max: Decimal) -> Self {
        self.min_amount = Some(min);
        self.max_amount = Some(max);
        self
    }

    /// Select a page
    pub fn page(mut self, page: u32) -> Self {
        self.page = page.max(1);
        self
    }

    /// Page size
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Row offset for the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }

    /// Whether an entry passes the non-paging criteria.
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.user_id.map_or(true, |u| entry.user_id == u)
            && self.kind.map_or(true, |k| entry.kind == k)
            && self.from_time.map_or(true, |t| entry.created_at >= t)
            && self.to_time.map_or(true, |t| entry.created_at <= t)
            && self.min_amount.map_or(true, |m| entry.amount >= m)
            && self.max_amount.map_or(true, |m| entry.amount <= m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::NewLedgerEntry;
    use rust_decimal_macros::dec;

    fn entry(user_id: AccountId, amount: Decimal, kind: TransactionKind) -> LedgerEntry {
        NewLedgerEntry {
            created_at: Utc::now(),
            user_id,
            amount,
            balance_before: dec!(0),
            balance_after: amount,
            reason: String::new(),
            operator: "system".into(),
            operator_id: 0,
            kind,
            ip: String::new(),
            device: String::new(),
            hash: String::new(),
        }
        .into_entry(1)
    }

    #[test]
    fn test_builder_filters() {
        let q = LedgerQuery::new()
            .user(1)
            .kind(TransactionKind::UserRefund)
            .amount_range(dec!(5), dec!(50));

        assert!(q.matches(&entry(1, dec!(10), TransactionKind::UserRefund)));
        assert!(!q.matches(&entry(2, dec!(10), TransactionKind::UserRefund)));
        assert!(!q.matches(&entry(1, dec!(10), TransactionKind::UserConsume)));
        assert!(!q.matches(&entry(1, dec!(60), TransactionKind::UserRefund)));
    }

    #[test]
    fn test_paging() {
        let q = LedgerQuery::new().page(0).limit(25);
        assert_eq!(q.page, 1);
        assert_eq!(q.offset(), 0);
        assert_eq!(LedgerQuery::new().page(4).limit(25).offset(), 75);
    }
}
