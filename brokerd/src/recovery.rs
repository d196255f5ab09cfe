//! Startup recovery of tasks stranded in `Processing`.
//!
//! A task is `Processing` only while a worker or the supervisor owns it, so
//! at startup every such row belongs to a dead process. Tasks that reached
//! the provider (they carry a remote id) are handed to the supervisor, which
//! resumes polling without resubmitting. The rest never left this side and
//! are rewound and queued again.
//!
//! Tasks left in `PendingExecution` may never have reached the queue (the
//! push after submission failed, or an in-memory queue died with the
//! process), so they are pushed again. A duplicate delivery is harmless: the
//! worker only claims tasks that are still `PendingExecution`.

use tracing::info;

use broker_domain::{TaskId, TaskStatus};
use broker_exec::poll::resumed_id;
use broker_kv::TaskQueue;
use broker_store::Store;

use crate::error::DaemonResult;
use crate::poller::PollerHandle;

/// What recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Adopted by the polling supervisor
    pub tracked: Vec<TaskId>,
    /// Rewound to `PendingExecution` and pushed to the queue
    pub requeued: Vec<TaskId>,
    /// Already `PendingExecution`, pushed again
    pub pending: Vec<TaskId>,
}

impl RecoveryReport {
    /// Number of tasks recovered.
    pub fn total(&self) -> usize {
        self.tracked.len() + self.requeued.len() + self.pending.len()
    }
}

/// Re-adopt or re-enqueue every stuck task and re-enqueue every waiting one.
pub async fn recover_stuck_tasks(
    store: &dyn Store,
    queue: &dyn TaskQueue,
    poller: &PollerHandle,
) -> DaemonResult<RecoveryReport> {
    // Read before rewinding, so rewound tasks are pushed once
    let waiting = store.tasks().find_by_status(TaskStatus::PendingExecution).await?;
    let stuck = store.tasks().find_stuck().await?;
    let mut report = RecoveryReport::default();

    for task in waiting {
        queue.push(task.id).await?;
        report.pending.push(task.id);
    }

    for mut task in stuck {
        if let Some(remote_task_id) = resumed_id(task.remote_task_id.as_deref()) {
            poller.track(&task)?;
            info!(task_id = task.id, %remote_task_id, "Recovered task handed to supervisor");
            report.tracked.push(task.id);
        } else {
            task.rewind()?;
            store.tasks().save(&task).await?;
            queue.push(task.id).await?;
            info!(task_id = task.id, "Recovered task re-enqueued");
            report.requeued.push(task.id);
        }
    }

    if report.total() > 0 {
        info!(
            tracked = report.tracked.len(),
            requeued = report.requeued.len(),
            pending = report.pending.len(),
            "Recovered tasks"
        );
    } else {
        info!("No tasks to recover");
    }
    Ok(report)
}
