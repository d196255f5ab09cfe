//! Entry signing.
//!
//! Each entry is signed with HMAC-SHA256 keyed by the process JWT secret over
//! the canonical line
//!
//! ```text
//! user|unix_nano|amount|before|after|reason|operator|kind|operator_id
//! ```
//!
//! with the three money fields rendered with exactly eight fractional digits.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;

use broker_domain::{AccountId, LedgerEntry, NewLedgerEntry, TransactionKind};

use crate::types::{LedgerError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Key used when no JWT secret is configured.
pub const DEFAULT_SECRET: &str = "default-secret";

/// The signed subset of an entry's fields.
#[derive(Debug, Clone, Copy)]
pub struct HashFields<'a> {
    pub user_id: AccountId,
    pub created_at: DateTime<Utc>,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reason: &'a str,
    pub operator: &'a str,
    pub kind: TransactionKind,
    pub operator_id: i64,
}

impl<'a> From<&'a NewLedgerEntry> for HashFields<'a> {
    fn from(e: &'a NewLedgerEntry) -> Self {
        Self {
            user_id: e.user_id,
            created_at: e.created_at,
            amount: e.amount,
            balance_before: e.balance_before,
            balance_after: e.balance_after,
            reason: &e.reason,
            operator: &e.operator,
            kind: e.kind,
            operator_id: e.operator_id,
        }
    }
}

impl<'a> From<&'a LedgerEntry> for HashFields<'a> {
    fn from(e: &'a LedgerEntry) -> Self {
        Self {
            user_id: e.user_id,
            created_at: e.created_at,
            amount: e.amount,
            balance_before: e.balance_before,
            balance_after: e.balance_after,
            reason: &e.reason,
            operator: &e.operator,
            kind: e.kind,
            operator_id: e.operator_id,
        }
    }
}

/// Canonical line that gets signed.
pub fn canonical_payload(fields: &HashFields<'_>) -> String {
    format!(
        "{}|{}|{:.8}|{:.8}|{:.8}|{}|{}|{}|{}",
        fields.user_id,
        fields.created_at.timestamp_nanos_opt().unwrap_or_default(),
        fields.amount,
        fields.balance_before,
        fields.balance_after,
        fields.reason,
        fields.operator,
        fields.kind,
        fields.operator_id,
    )
}

/// Signs and verifies ledger entries with a process-wide secret.
#[derive(Clone)]
pub struct LedgerSigner {
    secret: Vec<u8>,
}

impl LedgerSigner {
    /// Build a signer; an unset or empty secret falls back to [`DEFAULT_SECRET`].
    pub fn from_secret(secret: Option<&str>) -> Self {
        let secret = match secret {
            Some(s) if !s.is_empty() => s,
            _ => DEFAULT_SECRET,
        };
        Self { secret: secret.as_bytes().to_vec() }
    }

    /// Hex-encoded HMAC-SHA256 of the entry's canonical line.
    pub fn sign<'a>(&self, fields: impl Into<HashFields<'a>>) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LedgerError::Hash(format!("Invalid HMAC key: {}", e)))?;
        mac.update(canonical_payload(&fields.into()).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Whether a stored entry's hash matches its content.
    pub fn verify(&self, entry: &LedgerEntry) -> Result<bool> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LedgerError::Hash(format!("Invalid HMAC key: {}", e)))?;
        mac.update(canonical_payload(&HashFields::from(entry)).as_bytes());

        let Ok(expected) = hex::decode(&entry.hash) else {
            return Ok(false);
        };
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

/// Verify one entry against a secret (auditor entry point).
pub fn verify_entry(entry: &LedgerEntry, secret: Option<&str>) -> Result<bool> {
    LedgerSigner::from_secret(secret).verify(entry)
}

impl std::fmt::Debug for LedgerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn entry() -> LedgerEntry {
        NewLedgerEntry {
            created_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            user_id: 42,
            amount: dec!(-10),
            balance_before: dec!(100),
            balance_after: dec!(90),
            reason: "Create task for model: kling".to_string(),
            operator: "system".to_string(),
            operator_id: 0,
            kind: TransactionKind::UserConsume,
            ip: String::new(),
            device: String::new(),
            hash: String::new(),
        }
        .into_entry(1)
    }

    #[test]
    fn test_canonical_payload_format() {
        let e = entry();
        assert_eq!(
            canonical_payload(&HashFields::from(&e)),
            "42|1700000000123000000|-10.00000000|100.00000000|90.00000000|\
             Create task for model: kling|system|user_consume|0"
        );
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = LedgerSigner::from_secret(Some("s3cret"));
        let mut e = entry();
        e.hash = signer.sign(&e).unwrap();

        assert_eq!(e.hash.len(), 64);
        assert!(signer.verify(&e).unwrap());
    }

    #[test]
    fn test_any_field_change_invalidates_hash() {
        let signer = LedgerSigner::from_secret(Some("s3cret"));
        let mut signed = entry();
        signed.hash = signer.sign(&signed).unwrap();

        let tampered: Vec<Box<dyn Fn(&mut LedgerEntry)>> = vec![
            Box::new(|e| e.amount = dec!(-1)),
            Box::new(|e| e.balance_before = dec!(101)),
            Box::new(|e| e.balance_after = dec!(91)),
            Box::new(|e| e.reason.push('!')),
            Box::new(|e| e.operator = "mallory".into()),
            Box::new(|e| e.kind = TransactionKind::UserRefund),
            Box::new(|e| e.operator_id = 9),
            Box::new(|e| e.user_id = 43),
            Box::new(|e| e.created_at += chrono::TimeDelta::milliseconds(1)),
        ];
        for tamper in tampered {
            let mut e = signed.clone();
            tamper(&mut e);
            assert!(!signer.verify(&e).unwrap());
        }
    }

    #[test]
    fn test_missing_secret_uses_default() {
        let e = entry();
        let fallback = LedgerSigner::from_secret(None).sign(&e).unwrap();
        let explicit = LedgerSigner::from_secret(Some(DEFAULT_SECRET)).sign(&e).unwrap();
        let empty = LedgerSigner::from_secret(Some("")).sign(&e).unwrap();
        assert_eq!(fallback, explicit);
        assert_eq!(fallback, empty);
        assert_ne!(fallback, LedgerSigner::from_secret(Some("other")).sign(&e).unwrap());
    }

    #[test]
    fn test_garbage_hash_does_not_verify() {
        let mut e = entry();
        e.hash = "not-hex".to_string();
        assert!(!LedgerSigner::from_secret(None).verify(&e).unwrap());
    }

    #[test]
    fn test_verify_entry_with_secret() {
        let mut e = entry();
        e.hash = LedgerSigner::from_secret(Some("k")).sign(&e).unwrap();
        assert!(verify_entry(&e, Some("k")).unwrap());
        assert!(!verify_entry(&e, None).unwrap());
    }
}
