//! Broker Storage Layer
//!
//! Provides persistence for accounts, the ledger, tasks and AI models.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **Store transactions**: One unit of work spanning account rows, ledger
//!   appends and task inserts, used by the accounting engine
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use broker_domain::NewAccount;
//! use broker_store::{MemoryStore, Store};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     let account = store
//!         .accounts()
//!         .create(&NewAccount::user("alice", Decimal::new(100, 0), Decimal::ZERO))
//!         .await
//!         .unwrap();
//!
//!     let found = store.accounts().find_by_id(account.id).await.unwrap();
//!     println!("Found: {:?}", found.map(|a| a.username));
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
mod password;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::{MemoryStore, MemoryTransaction};
pub use password::{hash_password, verify_password};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgStoreTransaction};
pub use repository::{
    AccountRepository, LedgerRepository, ModelRepository, Page, Store, StoreTransaction,
    TaskRepository,
};
