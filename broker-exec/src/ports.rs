//! Execution layer port definitions.
//!
//! Ports define the seams between the worker and the outside world: the
//! executors that talk to generation providers, the object-storage uploader
//! they hand artifacts to, and the hooks that observe successful runs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use broker_domain::Task;

use crate::error::ExecError;

/// Free-form result of a successful run.
///
/// The built-in executors fill `oss_url`, `original_url` and `remote_task_id`.
pub type ExecutionOutput = Map<String, Value>;

/// Key of the re-hosted artifact URL in an [`ExecutionOutput`].
pub const OSS_URL: &str = "oss_url";
/// Key of the provider's artifact URL.
pub const ORIGINAL_URL: &str = "original_url";
/// Key of the provider's task identifier.
pub const REMOTE_TASK_ID: &str = "remote_task_id";

// =============================================================================
// Executor Port
// =============================================================================

/// Runs one task to completion.
///
/// Implementations:
/// - `RemoteApiExecutor` - generic submit/poll/download against any JSON API
/// - `VendorExecutor` - the jiekou.ai style provider
/// - `SimulatedExecutor` - sleeps and succeeds, for development
/// - `ScriptedExecutor` - replays configured outcomes, for tests
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute the task and return its result map.
    ///
    /// When `task.remote_task_id` is already set the executor must resume
    /// polling that remote task instead of submitting a new one.
    async fn run(&self, task: &Task) -> Result<ExecutionOutput, ExecError>;
}

// =============================================================================
// Uploader Port
// =============================================================================

/// Object-storage upload primitive.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload a local file under `object_key` and return its public URL.
    async fn upload(&self, local_path: &Path, object_key: &str) -> Result<String, ExecError>;
}

// =============================================================================
// Hook Port
// =============================================================================

/// Side-effect run after a successful execution, before the task completes.
///
/// Hooks must be idempotent: a task that is resumed after a crash can run
/// them again.
#[async_trait]
pub trait AfterExecutionHook: Send + Sync {
    /// Observe a finished run.
    async fn after_execution(&self, task: &Task, output: &ExecutionOutput)
        -> Result<(), ExecError>;
}

// =============================================================================
// Timing
// =============================================================================

/// Cadence and budgets of a polling executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    /// Delay between two status queries
    pub interval: Duration,
    /// Overall budget from the first query
    pub timeout: Duration,
    /// Budget of a single API call
    pub request_timeout: Duration,
    /// Budget of the artifact download
    pub download_timeout: Duration,
}

impl PollTiming {
    /// Timing of the generic remote API executor.
    pub fn remote_api() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10 * 60),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(60),
        }
    }

    /// Timing of the vendor executor (video generation takes longer).
    pub fn vendor() -> Self {
        Self { timeout: Duration::from_secs(30 * 60), ..Self::remote_api() }
    }

    /// Override the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the overall budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Pick the artifact URL out of an execution result: `oss_url`, then `result_url`.
pub fn result_url_of(output: &ExecutionOutput) -> Option<String> {
    [OSS_URL, "result_url"]
        .iter()
        .filter_map(|key| output.get(*key).and_then(Value::as_str))
        .find(|url| !url.is_empty())
        .map(str::to_string)
}
