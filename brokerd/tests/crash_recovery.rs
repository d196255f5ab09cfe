//! Integration tests for startup recovery of tasks stranded in `Processing`.
//!
//! A task with a remote id must be re-adopted and polled to completion
//! without a second submission; a task without one must be re-enqueued.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use broker_accounting::AccountingEngine;
use broker_domain::{AccountId, NewTask, Task, TaskInput, TaskStatus};
use broker_exec::{
    ExecutorRegistry, HookRegistry, PollTiming, RecordingUploader, VendorExecutor, VENDOR_API,
};
use broker_kv::{MemoryCache, MemoryQueue};
use broker_ledger::LedgerSigner;
use broker_store::{MemoryStore, Store};
use broker_testkit::{
    eventually, seed_account, seed_model, simulated_input, vendor_input, MockVendor, Result,
};
use brokerd::{recover_stuck_tasks, Config, Daemon, Outcomes, PollingSupervisor};

const WAIT: Duration = Duration::from_secs(5);

/// Insert a task as a crashed worker would have left it.
async fn stranded(
    store: &dyn Store,
    input: TaskInput,
    creator: AccountId,
    cost: Decimal,
    remote_task_id: Option<&str>,
) -> Result<Task> {
    let mut task = store
        .tasks()
        .insert(&NewTask::submitted(input, creator, "alice", cost, true))
        .await?;
    task.begin_processing()?;
    task.remote_task_id = remote_task_id.map(str::to_string);
    store.tasks().save(&task).await?;
    Ok(task)
}

#[tokio::test]
async fn test_restart_readopts_remote_task_and_completes_it() -> Result<()> {
    let vendor = MockVendor::start().await?;
    vendor.script(&["processing"]);

    let daemon = Daemon::in_memory(Config::test());
    let store = daemon.store().clone();
    let uploader = Arc::new(RecordingUploader::new("https://cdn.example"));
    let timing = PollTiming::vendor()
        .with_interval(Duration::from_millis(10))
        .with_timeout(Duration::from_secs(5));
    daemon.executors().register(
        VENDOR_API,
        Arc::new(
            VendorExecutor::new(uploader.clone(), "secret-key")
                .with_store(store.clone())
                .with_timing(timing),
        ),
    );

    let alice = seed_account(store.as_ref(), "alice", dec!(90), dec!(0)).await?;
    let model = seed_model(store.as_ref(), "video-1", &vendor.submit_url(), dec!(10)).await?;
    let input = vendor_input(model.id, &vendor.submit_url(), &vendor.query_template());
    let task = stranded(store.as_ref(), input, alice.id, dec!(10), Some("X")).await?;

    let running = daemon.start().await?;
    assert_eq!(running.recovery().tracked, vec![task.id]);
    assert!(running.recovery().requeued.is_empty());

    let done = eventually(WAIT, || async {
        let task = store.tasks().find_by_id(task.id).await.ok().flatten()?;
        (task.status == TaskStatus::Completed).then_some(task)
    })
    .await?;

    assert_eq!(done.result_url.as_deref(), Some("https://cdn.example/tasks/X.mp4"));
    assert_eq!(done.remote_task_id.as_deref(), Some("X"));
    assert_eq!(vendor.create_calls(), 0);
    assert!(vendor.query_calls() >= 2);
    assert_eq!(uploader.keys(), vec!["tasks/X.mp4"]);
    assert!(running.poller().tracked().await?.is_empty());

    // Completed without touching the balance
    assert_eq!(daemon.accounting().find_account(alice.id).await?.balance, dec!(90));
    running.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_restart_requeues_task_that_never_reached_the_provider() -> Result<()> {
    let daemon = Daemon::in_memory(Config::test());
    let store = daemon.store().clone();
    let alice = seed_account(store.as_ref(), "alice", dec!(90), dec!(0)).await?;
    let model = seed_model(store.as_ref(), "image-1", "https://vendor.test/img", dec!(10)).await?;
    let task = stranded(store.as_ref(), simulated_input(model.id, "a cat"), alice.id, dec!(10), None)
        .await?;

    let running = daemon.start().await?;
    assert_eq!(running.recovery().requeued, vec![task.id]);

    eventually(WAIT, || async {
        let task = store.tasks().find_by_id(task.id).await.ok().flatten()?;
        (task.status == TaskStatus::Completed).then_some(())
    })
    .await?;

    running.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_after_recovery_every_task_is_terminal_queued_or_tracked() -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
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
    // Long tick: nothing is polled while the test inspects the table
    let (supervisor, poller) = PollingSupervisor::new(
        store.clone(),
        Arc::new(ExecutorRegistry::new()),
        outcomes,
        Duration::from_secs(3600),
        5,
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(supervisor.run(shutdown.clone()));

    let alice = seed_account(store.as_ref(), "alice", dec!(100), dec!(0)).await?;
    let input = simulated_input(1, "x");
    let mut finished = stranded(store.as_ref(), input.clone(), alice.id, dec!(1), None).await?;
    finished.complete("https://cdn.test/done.mp4");
    store.tasks().save(&finished).await?;
    let fresh = stranded(store.as_ref(), input.clone(), alice.id, dec!(1), None).await?;
    let remote = stranded(store.as_ref(), input, alice.id, dec!(1), Some("r-7")).await?;

    let report = recover_stuck_tasks(store.as_ref(), queue.as_ref(), &poller).await?;
    assert_eq!(report.requeued, vec![fresh.id]);
    assert_eq!(report.tracked, vec![remote.id]);

    assert!(store.tasks().find_stuck().await?.iter().all(|t| t.id == remote.id));
    assert_eq!(queue.snapshot().await, vec![fresh.id]);
    assert_eq!(poller.tracked().await?, vec![remote.id]);
    let requeued = store.tasks().find_by_id(fresh.id).await?.unwrap();
    assert_eq!(requeued.status, TaskStatus::PendingExecution);
    let done = store.tasks().find_by_id(finished.id).await?.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    shutdown.cancel();
    Ok(())
}
