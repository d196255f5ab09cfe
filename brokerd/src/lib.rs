//! Broker Daemon
//!
//! Runtime orchestrator for the task execution core. Ties together:
//! - Task service: price lookup, charge, persist and enqueue in one call
//! - Worker pool: queue consumer driving tasks through their executors
//! - Polling supervisor: resumes remote tasks across restarts
//! - Recovery: re-adopts or re-enqueues tasks stranded in `Processing`
//!
//! # Architecture
//!
//! ```text
//! submit ──► TaskService ──► debit + insert (one tx) ──► queue
//!                                                         │
//!                     WorkerPool ◄────────────────────────┘
//!                         │ executor.run
//!                         ▼
//!                     Outcomes ──► Completed | retry ──► queue
//!                         ▲                 | Failed + refund
//!                         │
//!              PollingSupervisor ◄── recovery (tasks with a remote id)
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod outcome;
pub mod poller;
pub mod recovery;
pub mod submission;
pub mod worker;

pub use config::{AdminCredentials, Config, Environment};
pub use daemon::{Daemon, RunningDaemon};
pub use error::{DaemonError, DaemonResult};
pub use outcome::Outcomes;
pub use poller::{PollerHandle, PollingSupervisor, TrackRequest};
pub use recovery::{recover_stuck_tasks, RecoveryReport};
pub use submission::TaskService;
pub use worker::WorkerPool;
