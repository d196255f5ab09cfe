//! Polling executors against the in-process mock provider.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal_macros::dec;
use serde_json::json;

use broker_domain::{NewTask, Task, TaskInput};
use broker_exec::{
    ExecError, PollTiming, RecordingUploader, RemoteApiExecutor, TaskExecutor, VendorExecutor,
    ORIGINAL_URL, OSS_URL, REMOTE_TASK_ID,
};
use broker_store::{MemoryStore, Store};
use broker_testkit::{vendor_input, MockVendor, ARTIFACT_BYTES};

fn fast() -> PollTiming {
    PollTiming::vendor().with_interval(Duration::from_millis(10)).with_timeout(Duration::from_secs(5))
}

async fn insert(store: &MemoryStore, input: TaskInput) -> Result<Task> {
    Ok(store.tasks().insert(&NewTask::submitted(input, 1, "alice", dec!(10), true)).await?)
}

#[tokio::test]
async fn test_vendor_executor_submits_polls_and_rehosts() -> Result<()> {
    let vendor = MockVendor::start().await?;
    vendor.script(&["queued", "processing"]);
    let store = Arc::new(MemoryStore::new());
    let uploader = Arc::new(RecordingUploader::new("https://cdn.example"));
    let executor = VendorExecutor::new(uploader.clone(), "secret-key")
        .with_store(store.clone())
        .with_timing(fast());

    let task = insert(&store, vendor_input(1, &vendor.submit_url(), &vendor.query_template())).await?;
    let output = executor.run(&task).await?;

    assert_eq!(output[REMOTE_TASK_ID], json!("remote-1"));
    assert_eq!(output[OSS_URL], json!("https://cdn.example/tasks/remote-1.mp4"));
    assert_eq!(output[ORIGINAL_URL], json!(vendor.file_url("remote-1.mp4")));
    assert_eq!(uploader.keys(), vec!["tasks/remote-1.mp4"]);
    assert_eq!(uploader.last_contents().as_deref(), Some(ARTIFACT_BYTES));

    assert_eq!(vendor.last_authorization().as_deref(), Some("Bearer secret-key"));
    assert_eq!(vendor.last_create_body().unwrap()["prompt"], "a cat surfing a wave");
    assert_eq!(vendor.query_calls(), 3);

    let stored = store.tasks().find_by_id(task.id).await?.unwrap();
    assert_eq!(stored.remote_task_id.as_deref(), Some("remote-1"));
    Ok(())
}

#[tokio::test]
async fn test_vendor_executor_resumes_without_resubmitting() -> Result<()> {
    let vendor = MockVendor::start().await?;
    let uploader = Arc::new(RecordingUploader::new("https://cdn.example"));
    let executor = VendorExecutor::new(uploader.clone(), "k")
        .with_default_query_url(vendor.task_result_template())
        .with_timing(fast());

    let store = MemoryStore::new();
    let mut task = insert(&store, vendor_input(1, &vendor.submit_url(), "")).await?;
    task.remote_task_id = Some("X".to_string());

    let output = executor.run(&task).await?;
    assert_eq!(vendor.create_calls(), 0);
    assert_eq!(output[REMOTE_TASK_ID], json!("X"));
    assert_eq!(uploader.keys(), vec!["tasks/X.mp4"]);
    Ok(())
}

#[tokio::test]
async fn test_vendor_failure_status_is_terminal() -> Result<()> {
    let vendor = MockVendor::start().await?;
    vendor.set_final_status("TASK_STATUS_FAILED");
    let executor = VendorExecutor::new(Arc::new(RecordingUploader::new("https://cdn")), "k")
        .with_timing(fast());

    let store = MemoryStore::new();
    let task = insert(&store, vendor_input(1, &vendor.submit_url(), &vendor.query_template())).await?;
    let err = executor.run(&task).await.unwrap_err();

    assert!(matches!(err, ExecError::RemoteFailed(_)));
    assert_eq!(err.to_string(), "remote task failed: mock failure (status: TASK_STATUS_FAILED)");
    assert_eq!(vendor.download_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_vendor_polling_times_out() -> Result<()> {
    let vendor = MockVendor::start().await?;
    vendor.set_final_status("processing");
    let executor = VendorExecutor::new(Arc::new(RecordingUploader::new("https://cdn")), "k")
        .with_timing(fast().with_timeout(Duration::from_millis(100)));

    let store = MemoryStore::new();
    let task = insert(&store, vendor_input(1, &vendor.submit_url(), &vendor.query_template())).await?;
    let err = executor.run(&task).await.unwrap_err();

    assert!(matches!(err, ExecError::Timeout(_)));
    assert_eq!(err.to_string(), "task polling timed out");
    Ok(())
}

#[tokio::test]
async fn test_vendor_input_without_model_is_rejected() -> Result<()> {
    let executor = VendorExecutor::new(Arc::new(RecordingUploader::new("https://cdn")), "k");
    let store = MemoryStore::new();
    let task = insert(&store, TaskInput::from_value(&json!({"data": {"prompt": "x"}}))?).await?;

    let err = executor.run(&task).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid input: missing data or model in input");
    Ok(())
}

#[tokio::test]
async fn test_remote_api_executor_round_trip() -> Result<()> {
    let vendor = MockVendor::start().await?;
    vendor.script(&["running"]);
    let store = Arc::new(MemoryStore::new());
    let uploader = Arc::new(RecordingUploader::new("https://cdn.example"));
    let executor = RemoteApiExecutor::new(uploader.clone(), "api-key")
        .with_store(store.clone())
        .with_timing(fast());

    let input = TaskInput::from_value(&json!({
        "target_url": vendor.jobs_url(),
        "payload": {"prompt": "sunset"},
    }))?;
    let task = insert(&store, input).await?;
    let output = executor.run(&task).await?;

    // default query URL is <target_url>/<remote id>
    assert_eq!(output[REMOTE_TASK_ID], json!("job-1"));
    assert_eq!(output[ORIGINAL_URL], json!(vendor.file_url("job-1.mp4")));
    assert_eq!(vendor.query_calls(), 2);
    assert_eq!(vendor.last_authorization().as_deref(), Some("Bearer api-key"));

    let key = uploader.keys().pop().unwrap();
    let prefix = format!("tasks/{}/task_{}_", task.id, task.id);
    assert!(key.starts_with(&prefix), "unexpected key {key}");
    assert!(key.ends_with(".mp4"));
    assert_eq!(output[OSS_URL], json!(format!("https://cdn.example/{}", key)));
    assert_eq!(vendor.last_create_body().unwrap(), json!({"prompt": "sunset"}));

    let stored = store.tasks().find_by_id(task.id).await?.unwrap();
    assert_eq!(stored.remote_task_id.as_deref(), Some("job-1"));
    Ok(())
}

#[tokio::test]
async fn test_remote_api_upload_failure_surfaces() -> Result<()> {
    let vendor = MockVendor::start().await?;
    let executor =
        RemoteApiExecutor::new(Arc::new(RecordingUploader::failing("bucket gone")), "k")
            .with_timing(fast());

    let store = MemoryStore::new();
    let input = TaskInput::from_value(&json!({"target_url": vendor.jobs_url()}))?;
    let task = insert(&store, input).await?;

    let err = executor.run(&task).await.unwrap_err();
    assert_eq!(err.to_string(), "failed to upload to oss: bucket gone");
    assert_eq!(vendor.download_calls(), 1);
    Ok(())
}
