//! Broker Accounting Engine
//!
//! The only writer of balances and ledger entries. Every movement runs in a
//! single store transaction:
//!
//! ```text
//! lock account (v₀) → plan change → versioned UPDATE (v₀ → v₀+1)
//!     → append signed ledger entry → commit → invalidate user:<id>
//! ```
//!
//! A version mismatch aborts with `OptimisticConflict`; nothing is retried
//! here. Cached account snapshots are served to readers only and never
//! authorise a movement.

#![warn(clippy::all)]

pub mod engine;
pub mod error;

pub use engine::AccountingEngine;
pub use error::{AccountingError, AccountingResult};
