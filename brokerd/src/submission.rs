//! Task service: the single entry point for submitting and managing tasks.
//!
//! Submission prices the task from its model, charges the creator and inserts
//! the task row in one store transaction, then hands the id to the queue.
//! A failed push does not undo the charge: the task exists and is returned
//! inside [`DaemonError::Enqueue`].

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{info, warn};

use broker_accounting::AccountingEngine;
use broker_domain::{
    Account, AccountId, AiModel, ModelId, NewTask, Task, TaskFilter, TaskId, TaskInput,
    TaskStatus, TransactionKind, TransactionMeta,
};
use broker_kv::TaskQueue;
use broker_store::{Page, Store, StoreTransaction};

use crate::error::{DaemonError, DaemonResult};
use crate::poller::PollerHandle;

/// Submission, moderation and user-facing task operations.
pub struct TaskService {
    store: Arc<dyn Store>,
    accounting: Arc<AccountingEngine>,
    queue: Arc<dyn TaskQueue>,
    poller: Option<PollerHandle>,
    auto_audit: bool,
}

impl TaskService {
    /// Create a task service. With `auto_audit` new tasks skip moderation.
    pub fn new(
        store: Arc<dyn Store>,
        accounting: Arc<AccountingEngine>,
        queue: Arc<dyn TaskQueue>,
        auto_audit: bool,
    ) -> Self {
        Self { store, accounting, queue, poller: None, auto_audit }
    }

    /// Stop supervising tasks that users cancel.
    pub fn with_poller(mut self, poller: PollerHandle) -> Self {
        self.poller = Some(poller);
        self
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Price, charge, persist and enqueue a new task.
    pub async fn submit(&self, user_id: AccountId, input: TaskInput) -> DaemonResult<Task> {
        let model = self.resolve_model(&input).await?;

        let mut tx = self.store.begin().await?;
        let task = match self.charge_and_insert(tx.as_mut(), user_id, &model, input).await {
            Ok(task) => {
                tx.commit().await?;
                task
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(user_id, error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            },
        };
        drop(tx);
        self.accounting.invalidate(user_id).await;

        info!(
            task_id = task.id,
            user_id,
            model = %model.name,
            cost = %task.cost,
            status = %task.status,
            "Task submitted"
        );

        if task.status == TaskStatus::PendingExecution {
            self.enqueue(task).await
        } else {
            Ok(task)
        }
    }

    async fn charge_and_insert(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: AccountId,
        model: &AiModel,
        input: TaskInput,
    ) -> DaemonResult<Task> {
        let account: Account = if model.price > Decimal::ZERO {
            let reason = format!("Create task for model: {}", model.name);
            let meta = TransactionMeta::system(TransactionKind::UserConsume);
            self.accounting.debit_tx(tx, user_id, model.price, &reason, &meta).await?
        } else {
            tx.lock_account(user_id)
                .await?
                .ok_or_else(|| DaemonError::NotFound(format!("account {}", user_id)))?
        };

        let new_task =
            NewTask::submitted(input, user_id, account.username, model.price, self.auto_audit);
        Ok(tx.insert_task(&new_task).await?)
    }

    /// `model_id` / `modelId` (number or numeric string), else the model
    /// whose URL equals `model.model_url`.
    async fn resolve_model(&self, input: &TaskInput) -> DaemonResult<AiModel> {
        if let Some(model_id) = model_id_of(input) {
            return self
                .store
                .models()
                .find_by_id(model_id)
                .await?
                .ok_or_else(|| DaemonError::NotFound(format!("model {}", model_id)));
        }

        let model_url = input
            .field("model")
            .and_then(|m| m.get("model_url").and_then(Value::as_str).map(str::to_string))
            .filter(|url| !url.is_empty());
        if let Some(url) = model_url {
            if let Some(model) = self.store.models().find_by_url(&url).await? {
                return Ok(model);
            }
        }
        Err(DaemonError::Validation("model_id is required".to_string()))
    }

    async fn enqueue(&self, task: Task) -> DaemonResult<Task> {
        match self.queue.push(task.id).await {
            Ok(()) => Ok(task),
            Err(source) => {
                warn!(task_id = task.id, error = %source, "Failed to push task to queue");
                Err(DaemonError::Enqueue { task: Box::new(task), source })
            },
        }
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Moderation approval: `PendingAudit` → `PendingExecution`, then enqueue.
    pub async fn approve(&self, task_id: TaskId) -> DaemonResult<Task> {
        let mut task = self.load(task_id).await?;
        task.approve()?;
        self.store.tasks().save(&task).await?;
        info!(task_id, "Task approved");
        self.enqueue(task).await
    }

    /// Replace the input of a task that has not started processing.
    pub async fn update_input(
        &self,
        task_id: TaskId,
        user_id: AccountId,
        input: TaskInput,
    ) -> DaemonResult<Task> {
        self.load_owned(task_id, user_id).await?;
        let task = self.store.tasks().update_input(task_id, &input).await?;
        info!(task_id, "Task input updated");
        Ok(task)
    }

    /// Cancel a non-terminal task. A running executor is not interrupted;
    /// its result is discarded when it returns.
    pub async fn cancel(&self, task_id: TaskId, user_id: AccountId) -> DaemonResult<Task> {
        let mut task = self.load_owned(task_id, user_id).await?;
        let previous = task.status;
        task.cancel()?;
        self.store.tasks().save(&task).await?;
        if let Some(poller) = &self.poller {
            if let Err(e) = poller.untrack(task_id) {
                warn!(task_id, error = %e, "Could not untrack cancelled task");
            }
        }
        info!(task_id, from = %previous, "Task cancelled");
        Ok(task)
    }

    /// Run a failed task again with a fresh retry budget.
    ///
    /// The earlier failure refunded the cost, so the cost is charged again
    /// before the task is queued.
    pub async fn retry(&self, task_id: TaskId, user_id: AccountId) -> DaemonResult<Task> {
        let mut task = self.load_owned(task_id, user_id).await?;
        task.reset_for_retry()?;

        if task.cost > Decimal::ZERO {
            let meta = TransactionMeta::system(TransactionKind::UserConsume);
            let reason = format!("Retry task {}", task.id);
            self.accounting.debit(user_id, task.cost, &reason, &meta).await?;
        }
        if let Err(e) = self.store.tasks().save(&task).await {
            if task.cost > Decimal::ZERO {
                let reason = format!("Refund for task {} failure", task.id);
                if let Err(refund_err) = self.accounting.refund(user_id, task.cost, &reason).await {
                    warn!(task_id, error = %refund_err, "Could not return retry charge");
                }
            }
            return Err(e.into());
        }

        info!(task_id, "Task reset for retry");
        self.enqueue(task).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Load one task.
    pub async fn get_task(&self, task_id: TaskId) -> DaemonResult<Task> {
        self.load(task_id).await
    }

    /// Paged listing, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> DaemonResult<Page<Task>> {
        Ok(self.store.tasks().list(filter).await?)
    }

    async fn load(&self, task_id: TaskId) -> DaemonResult<Task> {
        self.store
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("task {}", task_id)))
    }

    /// Another user's task is reported as missing.
    async fn load_owned(&self, task_id: TaskId, user_id: AccountId) -> DaemonResult<Task> {
        let task = self.load(task_id).await?;
        if task.creator_id != user_id {
            return Err(DaemonError::NotFound(format!("task {}", task_id)));
        }
        Ok(task)
    }
}

/// Model id from `model_id` or `modelId`, as a number or a numeric string.
fn model_id_of(input: &TaskInput) -> Option<ModelId> {
    ["model_id", "modelId"].iter().find_map(|key| match input.field(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: Value) -> TaskInput {
        TaskInput::from_value(&value).unwrap()
    }

    #[test]
    fn test_model_id_forms() {
        assert_eq!(model_id_of(&input(json!({"model_id": 3}))), Some(3));
        assert_eq!(model_id_of(&input(json!({"modelId": "12"}))), Some(12));
        assert_eq!(model_id_of(&input(json!({"model_id": "abc", "modelId": 4}))), Some(4));
        assert_eq!(model_id_of(&input(json!({"model_id": 1.5}))), None);
        assert_eq!(model_id_of(&input(json!({"prompt": "x"}))), None);
    }
}
