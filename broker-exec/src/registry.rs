//! Executor and hook registries.
//!
//! Both are populated at startup and read on every task under a read lock.
//! Locks are never held across an await: readers clone the `Arc`s they need.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use broker_domain::{Task, TaskInput};

use crate::error::{ExecError, ExecResult};
use crate::ports::{AfterExecutionHook, ExecutionOutput, TaskExecutor};

/// Registry name of the generic remote API executor.
pub const REMOTE_API: &str = "remote_api";
/// Registry name of the vendor executor.
pub const VENDOR_API: &str = "jiekou_api";
/// Registry name of the built-in simulated executor.
pub const SIMULATED: &str = "simulated";

/// Name of the executor a task should run on.
///
/// `input.executor` wins; otherwise any `input.model` key selects the vendor
/// executor, an `input.target_url` the generic one, and anything else the
/// simulated path.
pub fn executor_name_for(input: &TaskInput) -> String {
    if let Some(name) = input.str_field("executor").filter(|n| !n.is_empty()) {
        return name;
    }
    if input.has_key("model") {
        return VENDOR_API.to_string();
    }
    if input.str_field("target_url").is_some_and(|u| !u.is_empty()) {
        return REMOTE_API.to_string();
    }
    SIMULATED.to_string()
}

// =============================================================================
// Executor Registry
// =============================================================================

/// Name → executor map.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an executor.
    pub fn register(&self, name: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        let name = name.into();
        info!(executor = %name, "Registering executor");
        self.executors.write().unwrap_or_else(PoisonError::into_inner).insert(name, executor);
    }

    /// Look up an executor.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Look up an executor, failing with `UnknownExecutor`.
    pub fn require(&self, name: &str) -> ExecResult<Arc<dyn TaskExecutor>> {
        self.get(name).ok_or_else(|| ExecError::UnknownExecutor(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

// =============================================================================
// Hook Registry
// =============================================================================

/// Ordered list of after-execution hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn AfterExecutionHook>>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook.
    pub fn register(&self, hook: Arc<dyn AfterExecutionHook>) {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook in registration order.
    ///
    /// Hooks are best effort: a failure is logged and the next hook still
    /// runs. Returns the number of failed hooks.
    pub async fn run_all(&self, task: &Task, output: &ExecutionOutput) -> usize {
        let hooks: Vec<_> = self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut failed = 0;
        for hook in hooks {
            if let Err(e) = hook.after_execution(task, output).await {
                warn!(task_id = task.id, error = %e, "After-execution hook failed");
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{RecordingHook, ScriptedExecutor};
    use broker_domain::{NewTask, TaskInput};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn input(value: serde_json::Value) -> TaskInput {
        TaskInput::from_value(&value).unwrap()
    }

    #[test]
    fn test_executor_selection_order() {
        assert_eq!(
            executor_name_for(&input(json!({"executor": "custom", "model": {}}))),
            "custom"
        );
        assert_eq!(
            executor_name_for(&input(json!({"model": {"model_url": "u"}, "target_url": "t"}))),
            VENDOR_API
        );
        assert_eq!(executor_name_for(&input(json!({"target_url": "https://api"}))), REMOTE_API);
        assert_eq!(executor_name_for(&input(json!({"prompt": "cat"}))), SIMULATED);
        assert_eq!(executor_name_for(&input(json!({"executor": "", "prompt": "x"}))), SIMULATED);
    }

    #[test]
    fn test_any_model_key_selects_vendor() {
        assert_eq!(
            executor_name_for(&input(json!({"model": "kling-v1", "prompt": "a cat"}))),
            VENDOR_API
        );
        assert_eq!(executor_name_for(&input(json!({"executor": "", "model": "x"}))), VENDOR_API);
        assert_eq!(executor_name_for(&input(json!({"model": null}))), VENDOR_API);
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ExecutorRegistry::new();
        registry.register("b", Arc::new(ScriptedExecutor::new()));
        registry.register("a", Arc::new(ScriptedExecutor::new()));

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(matches!(registry.require("missing"), Err(ExecError::UnknownExecutor(_))));
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_failures_do_not_stop_the_chain() {
        let hooks = HookRegistry::new();
        let first = Arc::new(RecordingHook::failing("boom"));
        let second = Arc::new(RecordingHook::new());
        hooks.register(first.clone());
        hooks.register(second.clone());

        let task = NewTask::submitted(input(json!({"prompt": "x"})), 1, "alice", dec!(0), true)
            .into_task(7, chrono::Utc::now());
        let failed = hooks.run_all(&task, &ExecutionOutput::new()).await;

        assert_eq!(failed, 1);
        assert_eq!(first.seen(), vec![7]);
        assert_eq!(second.seen(), vec![7]);
    }
}
