//! Polling supervisor: resumes remote tasks that outlived their worker.
//!
//! A single loop owns the table of tracked tasks. Everything else talks to it
//! through [`PollerHandle`] messages (track, untrack), so the table needs no
//! lock:
//!
//! ```text
//! track ──► ┌──────────────────────┐ ◄── tick (interval)
//! untrack ─►│ task_id → TrackEntry │
//!           └──────────┬───────────┘
//!                      │ one poll per entry and tick, skipped while in flight
//!                      ▼
//!              executor.run(task)  ──► done ──► complete / count failure
//! ```
//!
//! Executors resume from `remote_task_id`, so a poll never submits a new
//! remote job. Failed polls count against a per-entry budget that is
//! independent of the task's own `max_retries`; past it the task fails and
//! its cost is refunded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use broker_domain::{Task, TaskId, TaskStatus};
use broker_exec::{executor_name_for, ExecutionOutput, ExecutorRegistry};
use broker_store::Store;

use crate::error::{DaemonError, DaemonResult};
use crate::outcome::Outcomes;

// =============================================================================
// Handle
// =============================================================================

/// A task to adopt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRequest {
    /// Local task
    pub task_id: TaskId,
    /// Provider's identifier
    pub remote_task_id: String,
    /// Registry name of the executor that resumes it
    pub executor: String,
}

impl TrackRequest {
    /// Build a request from a task carrying a remote id.
    pub fn for_task(task: &Task) -> Option<Self> {
        let remote_task_id = task.remote_task_id.clone().filter(|id| !id.is_empty())?;
        Some(Self { task_id: task.id, remote_task_id, executor: executor_name_for(&task.input) })
    }
}

enum Command {
    Track(TrackRequest),
    Untrack(TaskId),
    Inspect(oneshot::Sender<Vec<TaskId>>),
}

/// Sending side of the supervisor's command channel. Cheap to clone.
///
/// Commands are applied in the order they were sent.
#[derive(Clone)]
pub struct PollerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl PollerHandle {
    /// Adopt a task. Fails when the task has no remote id.
    pub fn track(&self, task: &Task) -> DaemonResult<()> {
        let request = TrackRequest::for_task(task).ok_or_else(|| {
            DaemonError::Validation(format!("task {} has no remote task id", task.id))
        })?;
        self.send(Command::Track(request))
    }

    /// Stop supervising a task.
    pub fn untrack(&self, task_id: TaskId) -> DaemonResult<()> {
        self.send(Command::Untrack(task_id))
    }

    /// Ids currently tracked, ascending.
    pub async fn tracked(&self) -> DaemonResult<Vec<TaskId>> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Inspect(reply))?;
        answer.await.map_err(|_| DaemonError::Shutdown)
    }

    fn send(&self, command: Command) -> DaemonResult<()> {
        self.commands.send(command).map_err(|_| DaemonError::Shutdown)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

#[derive(Debug)]
struct TrackEntry {
    remote_task_id: String,
    failures: u32,
    executor: String,
}

/// What one poll observed.
#[derive(Debug)]
enum PollResult {
    /// Task row deleted
    Gone,
    /// Task already terminal
    Settled(TaskStatus),
    /// Executor succeeded
    Finished(ExecutionOutput),
    /// Executor or storage failed
    Failed(String),
}

/// The supervisor loop and its table.
pub struct PollingSupervisor {
    store: Arc<dyn Store>,
    executors: Arc<ExecutorRegistry>,
    outcomes: Arc<Outcomes>,
    interval: Duration,
    retry_budget: u32,
    commands: mpsc::UnboundedReceiver<Command>,
    entries: HashMap<TaskId, TrackEntry>,
    in_flight: HashMap<TaskId, JoinHandle<()>>,
}

impl PollingSupervisor {
    /// Create the supervisor and the handle used to feed it.
    pub fn new(
        store: Arc<dyn Store>,
        executors: Arc<ExecutorRegistry>,
        outcomes: Arc<Outcomes>,
        interval: Duration,
        retry_budget: u32,
    ) -> (Self, PollerHandle) {
        let (sender, commands) = mpsc::unbounded_channel();
        let supervisor = Self {
            store,
            executors,
            outcomes,
            interval,
            retry_budget,
            commands,
            entries: HashMap::new(),
            in_flight: HashMap::new(),
        };
        (supervisor, PollerHandle { commands: sender })
    }

    /// Run until `shutdown` is cancelled. Polls still in flight are aborted;
    /// their tasks stay `Processing` and are re-adopted on the next start.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            retry_budget = self.retry_budget,
            "Polling supervisor started"
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(TaskId, PollResult)>();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick is immediate

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Polling supervisor shutdown requested");
                    break;
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Track(request) => self.track(request),
                    Command::Untrack(task_id) => self.untrack(task_id),
                    Command::Inspect(reply) => {
                        let mut ids: Vec<TaskId> = self.entries.keys().copied().collect();
                        ids.sort_unstable();
                        let _ = reply.send(ids);
                    }
                },
                Some((task_id, result)) = done_rx.recv() => self.settle(task_id, result).await,
                _ = ticker.tick() => self.poll_all(&done_tx),
            }
        }

        for (_, poll) in self.in_flight.drain() {
            poll.abort();
        }
        info!(tracked = self.entries.len(), "Polling supervisor stopped");
    }

    fn track(&mut self, request: TrackRequest) {
        info!(
            task_id = request.task_id,
            remote_task_id = %request.remote_task_id,
            executor = %request.executor,
            "Tracking remote task"
        );
        self.entries.insert(
            request.task_id,
            TrackEntry {
                remote_task_id: request.remote_task_id,
                failures: 0,
                executor: request.executor,
            },
        );
    }

    fn untrack(&mut self, task_id: TaskId) {
        if self.entries.remove(&task_id).is_some() {
            info!(task_id, "Stopped tracking task");
        }
        if let Some(poll) = self.in_flight.remove(&task_id) {
            poll.abort();
        }
    }

    fn poll_all(&mut self, done: &mpsc::UnboundedSender<(TaskId, PollResult)>) {
        for (&task_id, entry) in &self.entries {
            if self.in_flight.contains_key(&task_id) {
                debug!(task_id, "Previous poll still running");
                continue;
            }
            debug!(task_id, remote_task_id = %entry.remote_task_id, "Polling tracked task");

            let store = self.store.clone();
            let executors = self.executors.clone();
            let remote_task_id = entry.remote_task_id.clone();
            let executor = entry.executor.clone();
            let done = done.clone();
            let poll = tokio::spawn(async move {
                let result = poll_once(store, executors, task_id, remote_task_id, &executor).await;
                let _ = done.send((task_id, result));
            });
            self.in_flight.insert(task_id, poll);
        }
    }

    async fn settle(&mut self, task_id: TaskId, result: PollResult) {
        self.in_flight.remove(&task_id);
        let Some(entry) = self.entries.get_mut(&task_id) else {
            debug!(task_id, "Poll finished for an untracked task");
            return;
        };

        match result {
            PollResult::Gone => {
                warn!(task_id, "Tracked task no longer exists");
                self.entries.remove(&task_id);
            },
            PollResult::Settled(status) => {
                info!(task_id, %status, "Tracked task already settled");
                self.entries.remove(&task_id);
            },
            PollResult::Finished(output) => {
                self.entries.remove(&task_id);
                if let Err(e) = self.outcomes.complete(task_id, &output).await {
                    error!(task_id, error = %e, "Failed to complete tracked task");
                }
            },
            PollResult::Failed(message) => {
                entry.failures += 1;
                if entry.failures <= self.retry_budget {
                    warn!(
                        task_id,
                        failures = entry.failures,
                        retry_budget = self.retry_budget,
                        error = %message,
                        "Poll failed, will retry"
                    );
                    return;
                }
                self.entries.remove(&task_id);
                if let Err(e) = self.outcomes.fail(task_id, &message).await {
                    error!(task_id, error = %e, "Failed to fail tracked task");
                }
            },
        }
    }
}

async fn poll_once(
    store: Arc<dyn Store>,
    executors: Arc<ExecutorRegistry>,
    task_id: TaskId,
    remote_task_id: String,
    executor: &str,
) -> PollResult {
    let mut task = match store.tasks().find_by_id(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return PollResult::Gone,
        Err(e) => return PollResult::Failed(e.to_string()),
    };
    if task.status.is_terminal() {
        return PollResult::Settled(task.status);
    }
    task.remote_task_id.get_or_insert(remote_task_id);

    let executor = match executors.require(executor) {
        Ok(executor) => executor,
        Err(e) => return PollResult::Failed(e.to_string()),
    };
    match executor.run(&task).await {
        Ok(output) => PollResult::Finished(output),
        Err(e) => PollResult::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_accounting::AccountingEngine;
    use broker_domain::{NewTask, TaskInput};
    use broker_exec::{HookRegistry, ScriptedExecutor, SIMULATED};
    use broker_kv::{MemoryCache, MemoryQueue};
    use broker_ledger::LedgerSigner;
    use broker_store::MemoryStore;
    use broker_testkit::{eventually, seed_account, simulated_input};
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        accounting: Arc<AccountingEngine>,
        executors: Arc<ExecutorRegistry>,
        handle: PollerHandle,
        shutdown: CancellationToken,
    }

    fn fixture(budget: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let accounting = Arc::new(AccountingEngine::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            LedgerSigner::from_secret(Some("test-secret")),
        ));
        let outcomes = Arc::new(Outcomes::new(
            store.clone(),
            accounting.clone(),
            Arc::new(MemoryQueue::new()),
            Arc::new(HookRegistry::new()),
            "https://cdn.test",
        ));
        let executors = Arc::new(ExecutorRegistry::new());
        let (supervisor, handle) = PollingSupervisor::new(
            store.clone(),
            executors.clone(),
            outcomes,
            Duration::from_millis(10),
            budget,
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(supervisor.run(shutdown.clone()));
        Fixture { store, accounting, executors, handle, shutdown }
    }

    async fn stuck_task(store: &MemoryStore, remote_task_id: &str) -> Task {
        let account = seed_account(store, "alice", dec!(90), dec!(0)).await.unwrap();
        let new_task = NewTask::submitted(
            simulated_input(1, "a cat"),
            account.id,
            "alice",
            dec!(10),
            true,
        );
        let mut task = store.tasks().insert(&new_task).await.unwrap();
        task.begin_processing().unwrap();
        task.remote_task_id = Some(remote_task_id.to_string());
        store.tasks().save(&task).await.unwrap();
        task
    }

    async fn status_of(store: &MemoryStore, task_id: TaskId) -> TaskStatus {
        store.tasks().find_by_id(task_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_tracked_task_completes_without_resubmission() {
        let f = fixture(5);
        let executor = Arc::new(ScriptedExecutor::succeeding("https://cdn.test/x.mp4"));
        f.executors.register(SIMULATED, executor.clone());
        let task = stuck_task(&f.store, "X").await;

        f.handle.track(&task).unwrap();
        assert_eq!(f.handle.tracked().await.unwrap(), vec![task.id]);

        eventually(Duration::from_secs(2), || async {
            (status_of(&f.store, task.id).await == TaskStatus::Completed).then_some(())
        })
        .await
        .unwrap();

        assert_eq!(executor.calls(), vec![(task.id, Some("X".to_string()))]);
        assert!(f.handle.tracked().await.unwrap().is_empty());
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_and_refunds() {
        let f = fixture(5);
        let executor = Arc::new(ScriptedExecutor::failing("provider unreachable"));
        f.executors.register(SIMULATED, executor.clone());
        let task = stuck_task(&f.store, "X").await;

        f.handle.track(&task).unwrap();
        eventually(Duration::from_secs(3), || async {
            (status_of(&f.store, task.id).await == TaskStatus::Failed).then_some(())
        })
        .await
        .unwrap();

        assert_eq!(executor.call_count(), 6);
        let account = f.accounting.find_account(task.creator_id).await.unwrap();
        assert_eq!(account.balance, dec!(100));
        let failed = f.store.tasks().find_by_id(task.id).await.unwrap().unwrap();
        assert!(failed.error_log.unwrap().contains("provider unreachable"));
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_untrack_and_settled_tasks_are_dropped() {
        let f = fixture(5);
        let executor = Arc::new(
            ScriptedExecutor::new()
                .with_delay(Duration::from_millis(200))
                .then_succeed(json!({"oss_url": "https://cdn.test/late.mp4"})),
        );
        f.executors.register(SIMULATED, executor.clone());
        let task = stuck_task(&f.store, "X").await;

        f.handle.track(&task).unwrap();
        f.handle.untrack(task.id).unwrap();
        assert!(f.handle.tracked().await.unwrap().is_empty());

        let mut cancelled = task.clone();
        cancelled.cancel().unwrap();
        f.store.tasks().save(&cancelled).await.unwrap();
        f.handle.track(&task).unwrap();
        eventually(Duration::from_secs(2), || async {
            f.handle.tracked().await.unwrap().is_empty().then_some(())
        })
        .await
        .unwrap();

        assert_eq!(executor.call_count(), 0);
        assert_eq!(status_of(&f.store, task.id).await, TaskStatus::Cancelled);
        f.shutdown.cancel();
    }

    #[test]
    fn test_track_request_requires_remote_id() {
        let mut task = NewTask::submitted(simulated_input(1, "x"), 1, "a", dec!(0), true)
            .into_task(1, chrono::Utc::now());
        assert!(TrackRequest::for_task(&task).is_none());

        task.input = TaskInput::from_value(&json!({"model": {"model_url": "u"}})).unwrap();
        task.remote_task_id = Some("r-1".into());
        let request = TrackRequest::for_task(&task).unwrap();
        assert_eq!(request.executor, "jiekou_api");
        assert_eq!(request.remote_task_id, "r-1");
    }
}
