//! Stub implementations for development and testing.
//!
//! These simulate provider and storage behaviour without network calls.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use broker_domain::{Task, TaskId};

use crate::error::{ExecError, ExecResult};
use crate::ports::{AfterExecutionHook, ExecutionOutput, TaskExecutor, Uploader, OSS_URL};

// =============================================================================
// Simulated Executor
// =============================================================================

/// Built-in executor for tasks that name no provider.
///
/// Sleeps for the configured delay, then succeeds with `{"status":"ok"}`
/// unless `input.prompt` contains `fail`.
pub struct SimulatedExecutor {
    delay: Duration,
}

impl SimulatedExecutor {
    /// Create a simulated executor.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn run(&self, task: &Task) -> ExecResult<ExecutionOutput> {
        info!(task_id = task.id, "Running simulated task");
        tokio::time::sleep(self.delay).await;

        if task.input.str_field("prompt").is_some_and(|p| p.contains("fail")) {
            return Err(ExecError::RemoteFailed("simulated failure".to_string()));
        }
        Ok(output(json!({"status": "ok"})))
    }
}

// =============================================================================
// Scripted Executor
// =============================================================================

/// Executor replaying queued outcomes; once the script runs out it repeats
/// the fallback outcome.
pub struct ScriptedExecutor {
    script: RwLock<VecDeque<Result<ExecutionOutput, String>>>,
    fallback: Result<ExecutionOutput, String>,
    delay: Duration,
    calls: RwLock<Vec<(TaskId, Option<String>)>>,
}

impl ScriptedExecutor {
    /// Succeeds with an empty result map.
    pub fn new() -> Self {
        Self {
            script: RwLock::new(VecDeque::new()),
            fallback: Ok(ExecutionOutput::new()),
            delay: Duration::ZERO,
            calls: RwLock::new(Vec::new()),
        }
    }

    /// Always succeeds with `oss_url = url`.
    pub fn succeeding(url: &str) -> Self {
        Self { fallback: Ok(output(json!({ OSS_URL: url }))), ..Self::new() }
    }

    /// Always fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self { fallback: Err(message.to_string()), ..Self::new() }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue one failure ahead of the fallback.
    pub fn then_fail(self, message: &str) -> Self {
        self.script.write().unwrap().push_back(Err(message.to_string()));
        self
    }

    /// Queue one success ahead of the fallback.
    pub fn then_succeed(self, result: Value) -> Self {
        self.script.write().unwrap().push_back(Ok(output(result)));
        self
    }

    /// Number of runs so far.
    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// `(task id, remote id seen)` of every run.
    pub fn calls(&self) -> Vec<(TaskId, Option<String>)> {
        self.calls.read().unwrap().clone()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn run(&self, task: &Task) -> ExecResult<ExecutionOutput> {
        self.calls.write().unwrap().push((task.id, task.remote_task_id.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.write().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone()).map_err(ExecError::RemoteFailed)
    }
}

// =============================================================================
// Recording Uploader
// =============================================================================

/// Uploader that records calls and returns `<base>/<key>`.
pub struct RecordingUploader {
    base_url: String,
    uploads: RwLock<Vec<(PathBuf, String, Vec<u8>)>>,
    fail_with: Option<String>,
}

impl RecordingUploader {
    /// Create an uploader answering under `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            uploads: RwLock::new(Vec::new()),
            fail_with: None,
        }
    }

    /// Uploader whose every call fails.
    pub fn failing(message: &str) -> Self {
        Self { fail_with: Some(message.to_string()), ..Self::new("") }
    }

    /// Object keys uploaded so far.
    pub fn keys(&self) -> Vec<String> {
        self.uploads.read().unwrap().iter().map(|(_, key, _)| key.clone()).collect()
    }

    /// Bytes of the most recent upload.
    pub fn last_contents(&self) -> Option<Vec<u8>> {
        self.uploads.read().unwrap().last().map(|(_, _, bytes)| bytes.clone())
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, local_path: &Path, object_key: &str) -> ExecResult<String> {
        if let Some(message) = &self.fail_with {
            return Err(ExecError::Upload(message.clone()));
        }
        let bytes = tokio::fs::read(local_path).await?;
        self.uploads.write().unwrap().push((
            local_path.to_path_buf(),
            object_key.to_string(),
            bytes,
        ));
        Ok(format!("{}/{}", self.base_url, object_key))
    }
}

// =============================================================================
// Recording Hook
// =============================================================================

/// Hook recording the ids of the tasks it observed.
#[derive(Default)]
pub struct RecordingHook {
    seen: RwLock<Vec<TaskId>>,
    fail_with: Option<String>,
}

impl RecordingHook {
    /// A hook that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// A hook that records, then fails.
    pub fn failing(message: &str) -> Self {
        Self { seen: RwLock::new(Vec::new()), fail_with: Some(message.to_string()) }
    }

    /// Task ids observed so far.
    pub fn seen(&self) -> Vec<TaskId> {
        self.seen.read().unwrap().clone()
    }
}

#[async_trait]
impl AfterExecutionHook for RecordingHook {
    async fn after_execution(&self, task: &Task, _output: &ExecutionOutput) -> ExecResult<()> {
        self.seen.write().unwrap().push(task.id);
        match &self.fail_with {
            Some(message) => Err(ExecError::Hook(message.clone())),
            None => Ok(()),
        }
    }
}

fn output(value: Value) -> ExecutionOutput {
    match value {
        Value::Object(map) => map,
        _ => ExecutionOutput::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::{NewTask, TaskInput};
    use rust_decimal_macros::dec;

    fn task(prompt: &str) -> Task {
        let input = TaskInput::from_value(&json!({ "prompt": prompt })).unwrap();
        NewTask::submitted(input, 1, "alice", dec!(0), true).into_task(1, chrono::Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_executor() {
        let executor = SimulatedExecutor::default();
        let ok = executor.run(&task("a cat")).await.unwrap();
        assert_eq!(ok.get("status"), Some(&json!("ok")));

        let err = executor.run(&task("please fail")).await.unwrap_err();
        assert_eq!(err.to_string(), "simulated failure");
    }

    #[tokio::test]
    async fn test_scripted_executor_replays_then_falls_back() {
        let executor = ScriptedExecutor::succeeding("https://cdn/x").then_fail("first");
        assert!(executor.run(&task("p")).await.is_err());
        let ok = executor.run(&task("p")).await.unwrap();
        assert_eq!(ok.get(OSS_URL), Some(&json!("https://cdn/x")));
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_recording_uploader() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"artifact").unwrap();

        let uploader = RecordingUploader::new("https://cdn/");
        let url = uploader.upload(file.path(), "tasks/1/a.mp4").await.unwrap();
        assert_eq!(url, "https://cdn/tasks/1/a.mp4");
        assert_eq!(uploader.keys(), vec!["tasks/1/a.mp4"]);
        assert_eq!(uploader.last_contents().as_deref(), Some(&b"artifact"[..]));

        let failing = RecordingUploader::failing("bucket gone");
        assert!(matches!(failing.upload(file.path(), "k").await, Err(ExecError::Upload(_))));
    }
}
