//! Broker Execution Layer
//!
//! Runs tasks against generation providers and re-hosts their artifacts.
//!
//! - **Registry**: name → [`TaskExecutor`], plus the after-execution hook list
//! - **Executors**: `remote_api` (any JSON API), `jiekou_api` (vendor),
//!   `simulated` (built-in sleep-then-ok)
//! - **Uploader**: object-storage port; [`LocalDirUploader`] for single-node
//!   deployments, [`RecordingUploader`] for tests
//!
//! The polling executors write the provider's task id back to the task row
//! right after submission, and skip submission when a task already carries
//! one. That breadcrumb is what lets a restarted daemon resume instead of
//! paying for a second remote job.

#![warn(clippy::all)]

pub mod error;
pub mod http;
pub mod poll;
pub mod ports;
pub mod registry;
pub mod remote_api;
pub mod stub;
pub mod upload;
pub mod vendor;

pub use error::{ExecError, ExecResult};
pub use ports::{
    result_url_of, AfterExecutionHook, ExecutionOutput, PollTiming, TaskExecutor, Uploader,
    ORIGINAL_URL, OSS_URL, REMOTE_TASK_ID,
};
pub use registry::{
    executor_name_for, ExecutorRegistry, HookRegistry, REMOTE_API, SIMULATED, VENDOR_API,
};
pub use remote_api::RemoteApiExecutor;
pub use stub::{RecordingHook, RecordingUploader, ScriptedExecutor, SimulatedExecutor};
pub use upload::LocalDirUploader;
pub use vendor::{VendorExecutor, DEFAULT_QUERY_URL};
