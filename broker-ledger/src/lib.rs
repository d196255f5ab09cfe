//! Ledger Module
//!
//! The ledger is the append-only record of balance movements. This crate holds
//! the storage-independent parts of it:
//! - HMAC-SHA256 signing and verification of entries
//! - The query filter shared by every store backend
//! - The CSV export projection
//!
//! Appending happens inside the accounting engine's store transaction; see
//! `broker-store` and `broker-accounting`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use broker_ledger::{LedgerQuery, LedgerSigner};
//!
//! let signer = LedgerSigner::from_secret(Some("jwt-secret"));
//! entry.hash = signer.sign(&entry)?;
//! assert!(signer.verify(&stored)?);
//!
//! let query = LedgerQuery::new().user(42).kind(TransactionKind::UserRefund).limit(50);
//! ```

pub mod export;
pub mod hash;
pub mod query;
pub mod types;

pub use export::{to_csv, write_csv, CSV_HEADER};
pub use hash::{canonical_payload, verify_entry, HashFields, LedgerSigner, DEFAULT_SECRET};
pub use query::LedgerQuery;
pub use types::{LedgerError, Result};
