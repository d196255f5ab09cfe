//! Worker pool: drains the task queue and runs each task on its executor.
//!
//! One loop blocks on the queue and spawns a worker per popped id, bounded by
//! a semaphore. A worker only claims tasks still in `PendingExecution`, which
//! makes duplicate deliveries harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use broker_domain::{TaskId, TaskStatus};
use broker_exec::{executor_name_for, ExecutorRegistry};
use broker_kv::TaskQueue;
use broker_store::Store;

use crate::error::DaemonResult;
use crate::outcome::Outcomes;

/// Longest single queue wait; the loop re-checks shutdown between waits.
const POP_WAIT: Duration = Duration::from_secs(5);
/// Pause after a queue error.
const QUEUE_BACKOFF: Duration = Duration::from_secs(1);
/// How long shutdown waits for running workers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Queue consumer and task runner.
pub struct WorkerPool {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    executors: Arc<ExecutorRegistry>,
    outcomes: Arc<Outcomes>,
    concurrency: usize,
}

impl WorkerPool {
    /// Create a pool running at most `concurrency` tasks at once.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        executors: Arc<ExecutorRegistry>,
        outcomes: Arc<Outcomes>,
        concurrency: usize,
    ) -> Self {
        Self { store, queue, executors, outcomes, concurrency: concurrency.max(1) }
    }

    /// Consume the queue until `shutdown` is cancelled.
    ///
    /// Workers still running after the grace period are left behind; their
    /// tasks stay `Processing` and startup recovery picks them up.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(concurrency = self.concurrency, "Worker pool started");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.queue.pop(POP_WAIT) => popped,
            };

            match popped {
                Ok(Some(task_id)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = worker.process(task_id).await {
                            error!(task_id, error = %e, "Task processing error");
                        }
                    });
                },
                Ok(None) => {},
                Err(e) => {
                    error!(error = %e, "Queue pop failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_BACKOFF) => {}
                    }
                },
            }
        }

        info!("Worker pool shutdown requested");
        let all = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, permits.acquire_many(all)).await;
        match drained {
            Ok(_) => info!("Worker pool stopped"),
            Err(_) => warn!("Worker pool stopped with tasks still running"),
        };
    }

    /// Run one dequeued task to its next state.
    pub async fn process(&self, task_id: TaskId) -> DaemonResult<()> {
        let Some(mut task) = self.store.tasks().find_by_id(task_id).await? else {
            warn!(task_id, "Dequeued task no longer exists, dropping");
            return Ok(());
        };
        if task.status != TaskStatus::PendingExecution {
            debug!(task_id, status = %task.status, "Dequeued task is not pending execution, skipping");
            return Ok(());
        }

        task.begin_processing()?;
        self.store.tasks().save(&task).await?;

        let executor_name = executor_name_for(&task.input);
        info!(task_id, executor = %executor_name, attempt = task.retry_count + 1, "Task processing");

        let result = match self.executors.require(&executor_name) {
            Ok(executor) => executor.run(&task).await,
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(output) => self.outcomes.complete(task_id, &output).await?,
            Err(e) => {
                warn!(task_id, executor = %executor_name, kind = %e.kind(), error = %e, "Execution failed");
                self.outcomes.retry_or_fail(task_id, &e.to_string()).await?
            },
        };
        debug!(task_id, %status, "Task run finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_accounting::AccountingEngine;
    use broker_domain::NewTask;
    use broker_exec::{HookRegistry, ScriptedExecutor, SIMULATED};
    use broker_kv::{MemoryCache, MemoryQueue};
    use broker_ledger::LedgerSigner;
    use broker_store::MemoryStore;
    use broker_testkit::{eventually, seed_account, simulated_input};
    use rust_decimal_macros::dec;

    fn pool(
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        executors: Arc<ExecutorRegistry>,
    ) -> Arc<WorkerPool> {
        let accounting = Arc::new(AccountingEngine::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            LedgerSigner::from_secret(Some("test-secret")),
        ));
        let outcomes = Arc::new(Outcomes::new(
            store.clone(),
            accounting,
            queue.clone(),
            Arc::new(HookRegistry::new()),
            "https://cdn.test",
        ));
        Arc::new(WorkerPool::new(store, queue, executors, outcomes, 2))
    }

    async fn queued_task(store: &MemoryStore, queue: &MemoryQueue, auto_audit: bool) -> TaskId {
        let account = seed_account(store, "alice", dec!(10), dec!(0)).await.unwrap();
        let new_task =
            NewTask::submitted(simulated_input(1, "a cat"), account.id, "alice", dec!(0), auto_audit);
        let task = store.tasks().insert(&new_task).await.unwrap();
        queue.push(task.id).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_pool_runs_queued_task_and_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let executors = Arc::new(ExecutorRegistry::new());
        let executor = Arc::new(ScriptedExecutor::succeeding("https://cdn.test/a.png"));
        executors.register(SIMULATED, executor.clone());
        let task_id = queued_task(&store, &queue, true).await;

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(pool(store.clone(), queue, executors).run(shutdown.clone()));

        let done = eventually(Duration::from_secs(5), || async {
            let task = store.tasks().find_by_id(task_id).await.ok().flatten()?;
            (task.status == TaskStatus::Completed).then_some(task)
        })
        .await
        .unwrap();
        assert_eq!(done.result_url.as_deref(), Some("https://cdn.test/a.png"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_task_awaiting_moderation_is_not_claimed() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let executors = Arc::new(ExecutorRegistry::new());
        let executor = Arc::new(ScriptedExecutor::succeeding("https://cdn.test/a.png"));
        executors.register(SIMULATED, executor.clone());
        let task_id = queued_task(&store, &queue, false).await;

        pool(store.clone(), queue, executors).process(task_id).await.unwrap();

        let task = store.tasks().find_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::PendingAudit);
        assert_eq!(executor.call_count(), 0);
    }
}
