//! Terminal bookkeeping shared by the worker pool and the polling supervisor.
//!
//! Every write starts from a fresh read of the task row: the caller's copy is
//! stale by the time an executor returns, and a user may have cancelled the
//! task meanwhile. A task found `Cancelled` stays `Cancelled`.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use broker_accounting::AccountingEngine;
use broker_domain::{FailureDisposition, Task, TaskId, TaskStatus};
use broker_exec::{result_url_of, ExecutionOutput, HookRegistry};
use broker_kv::TaskQueue;
use broker_store::Store;

use crate::error::{DaemonError, DaemonResult};

/// Applies execution results to task rows.
pub struct Outcomes {
    store: Arc<dyn Store>,
    accounting: Arc<AccountingEngine>,
    queue: Arc<dyn TaskQueue>,
    hooks: Arc<HookRegistry>,
    public_base: String,
}

impl Outcomes {
    /// Create the outcome handler. `public_base` prefixes the synthetic
    /// result URL of runs that produced no artifact.
    pub fn new(
        store: Arc<dyn Store>,
        accounting: Arc<AccountingEngine>,
        queue: Arc<dyn TaskQueue>,
        hooks: Arc<HookRegistry>,
        public_base: impl Into<String>,
    ) -> Self {
        let public_base = public_base.into().trim_end_matches('/').to_string();
        Self { store, accounting, queue, hooks, public_base }
    }

    async fn reload(&self, task_id: TaskId) -> DaemonResult<Task> {
        self.store
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("task {}", task_id)))
    }

    /// Successful run: hooks, then `Completed` with the artifact URL.
    ///
    /// Returns the status the task ends up in.
    pub async fn complete(
        &self,
        task_id: TaskId,
        output: &ExecutionOutput,
    ) -> DaemonResult<TaskStatus> {
        let mut task = self.reload(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            info!(task_id, "Task cancelled while running, keeping Cancelled");
            return Ok(task.status);
        }
        if task.status.is_terminal() {
            warn!(task_id, status = %task.status, "Run finished for a settled task, ignoring");
            return Ok(task.status);
        }

        let failed_hooks = self.hooks.run_all(&task, output).await;
        let url = result_url_of(output)
            .unwrap_or_else(|| format!("{}/result/{}", self.public_base, task.id));
        if task.complete(url) {
            self.store.tasks().save(&task).await?;
            info!(
                task_id,
                result_url = task.result_url.as_deref().unwrap_or_default(),
                failed_hooks,
                "Task completed"
            );
        }
        Ok(task.status)
    }

    /// Failed run charged against the task's retry budget.
    ///
    /// With budget left the task goes back to the queue; otherwise it fails
    /// and its cost is refunded.
    pub async fn retry_or_fail(&self, task_id: TaskId, message: &str) -> DaemonResult<TaskStatus> {
        let mut task = self.reload(task_id).await?;
        if task.status.is_terminal() {
            info!(task_id, status = %task.status, error = message, "Run failed for a settled task");
            return Ok(task.status);
        }

        match task.record_failure(message) {
            FailureDisposition::Retry => {
                self.store.tasks().save(&task).await?;
                warn!(
                    task_id,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    error = message,
                    "Task failed, retrying"
                );
                self.queue.push(task.id).await?;
            },
            FailureDisposition::Exhausted => {
                self.store.tasks().save(&task).await?;
                error!(task_id, error = message, "Task failed permanently");
                self.refund(&mut task).await?;
            },
        }
        Ok(task.status)
    }

    /// Permanent failure regardless of the retry budget, with refund.
    pub async fn fail(&self, task_id: TaskId, message: &str) -> DaemonResult<TaskStatus> {
        let mut task = self.reload(task_id).await?;
        if task.status.is_terminal() {
            info!(task_id, status = %task.status, error = message, "Failure for a settled task");
            return Ok(task.status);
        }

        task.mark_failed(message);
        self.store.tasks().save(&task).await?;
        error!(task_id, error = message, "Task failed permanently");
        self.refund(&mut task).await?;
        Ok(task.status)
    }

    /// Give a failed task's cost back. A refund error is recorded on the
    /// task; the task stays `Failed`.
    async fn refund(&self, task: &mut Task) -> DaemonResult<()> {
        if task.cost <= Decimal::ZERO {
            return Ok(());
        }

        let reason = format!("Refund for task {} failure", task.id);
        match self.accounting.refund(task.creator_id, task.cost, &reason).await {
            Ok(account) => {
                info!(
                    task_id = task.id,
                    user_id = task.creator_id,
                    amount = %task.cost,
                    balance = %account.balance,
                    "Task cost refunded"
                );
            },
            Err(e) => {
                error!(task_id = task.id, user_id = task.creator_id, error = %e, "Refund failed");
                task.append_error(&format!("Refund failed: {}", e));
                self.store.tasks().save(task).await?;
            },
        }
        Ok(())
    }
}
