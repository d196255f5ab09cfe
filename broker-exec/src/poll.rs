//! Status polling loop and the resume breadcrumb.

use std::sync::Arc;

use reqwest::RequestBuilder;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use broker_domain::TaskId;
use broker_store::Store;

use crate::error::{ExecError, ExecResult};
use crate::http::send_json;
use crate::ports::PollTiming;

/// Poll until `classify` reports a terminal state.
///
/// `classify` returns `Ok(Some(url))` once the artifact is ready, `Ok(None)`
/// while the remote task is still running, and `Err` on a terminal failure.
/// Transport errors and undecodable bodies count as "still running".
pub async fn poll_until<B, C>(
    task_id: TaskId,
    timing: PollTiming,
    build_request: B,
    mut classify: C,
) -> ExecResult<String>
where
    B: Fn() -> RequestBuilder,
    C: FnMut(&Value) -> ExecResult<Option<String>>,
{
    timeout(timing.timeout, poll_loop(task_id, timing, build_request, &mut classify))
        .await
        .map_err(|_| ExecError::Timeout("task polling timed out".to_string()))?
}

async fn poll_loop<B, C>(
    task_id: TaskId,
    timing: PollTiming,
    build_request: B,
    classify: &mut C,
) -> ExecResult<String>
where
    B: Fn() -> RequestBuilder,
    C: FnMut(&Value) -> ExecResult<Option<String>>,
{
    loop {
        sleep(timing.interval).await;
        let body = match send_json(build_request(), timing.request_timeout).await {
            Ok(body) => body,
            Err(e) => {
                warn!(task_id, error = %e, "Polling error");
                continue;
            },
        };
        debug!(task_id, %body, "Polled remote task");
        if let Some(url) = classify(&body)? {
            return Ok(url);
        }
    }
}

/// Write the provider's id back to the task row before polling starts.
///
/// Best effort: a failed write only costs a resubmission after a crash.
pub async fn record_remote_task_id(
    store: Option<&Arc<dyn Store>>,
    task_id: TaskId,
    remote_task_id: &str,
) {
    let Some(store) = store else { return };
    match store.tasks().set_remote_task_id(task_id, remote_task_id).await {
        Ok(()) => info!(task_id, remote_task_id, "Recorded remote task id"),
        Err(e) => warn!(task_id, remote_task_id, error = %e, "Failed to record remote task id"),
    }
}

/// The task's existing remote id, if it is resuming.
pub fn resumed_id(remote_task_id: Option<&str>) -> Option<String> {
    remote_task_id.filter(|id| !id.is_empty()).map(str::to_string)
}
