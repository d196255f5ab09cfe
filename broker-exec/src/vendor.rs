//! Vendor executor (`jiekou_api`).
//!
//! Expects `input.model.model_url` (submission endpoint), optional
//! `input.model.headers` and `input.model.query_url_template`, and the
//! request body in `input.data`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use broker_domain::Task;
use broker_store::Store;

use crate::error::{ExecError, ExecResult};
use crate::http::{download, fill_template, id_string, non_empty_str, send_json, url_extension};
use crate::poll::{poll_until, record_remote_task_id, resumed_id};
use crate::ports::{
    ExecutionOutput, PollTiming, TaskExecutor, Uploader, ORIGINAL_URL, OSS_URL, REMOTE_TASK_ID,
};

/// Task-result endpoint used when neither the submission response nor the
/// model names one.
pub const DEFAULT_QUERY_URL: &str = "https://api.jiekou.ai/v3/async/task-result?task_id=%s";

const SUCCESS_STATUSES: [&str; 4] = ["TASK_STATUS_SUCCEED", "SUCCESS", "COMPLETED", "SUCCEEDED"];
const FAILURE_STATUSES: [&str; 3] = ["TASK_STATUS_FAILED", "FAILED", "ERROR"];

/// Media arrays checked for an artifact, with the URL field of their items.
const MEDIA_FIELDS: [(&str, &str); 3] =
    [("videos", "video_url"), ("images", "image_url"), ("audios", "audio_url")];
const URL_FIELDS: [&str; 4] = ["url", "file_url", "result_url", "output"];

#[derive(Debug, Deserialize)]
struct VendorInput {
    data: Option<Map<String, Value>>,
    model: Option<VendorModel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VendorModel {
    model_url: String,
    headers: Map<String, Value>,
    query_url_template: String,
}

/// Executor for the jiekou.ai style asynchronous generation API.
pub struct VendorExecutor {
    client: Client,
    uploader: Arc<dyn Uploader>,
    store: Option<Arc<dyn Store>>,
    api_key: String,
    default_query_url: String,
    timing: PollTiming,
}

impl VendorExecutor {
    /// Create an executor sending `Authorization: Bearer <api_key>`.
    pub fn new(uploader: Arc<dyn Uploader>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            uploader,
            store: None,
            api_key: api_key.into(),
            default_query_url: DEFAULT_QUERY_URL.to_string(),
            timing: PollTiming::vendor(),
        }
    }

    /// Record remote ids on submission so a restart can resume.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override polling cadence and budgets.
    pub fn with_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Override the fallback task-result endpoint (`%s` = remote id).
    pub fn with_default_query_url(mut self, template: impl Into<String>) -> Self {
        let template = template.into();
        if !template.is_empty() {
            self.default_query_url = template;
        }
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
    }

    /// Submit and return the remote id plus the body (which may carry a query URL).
    async fn submit(&self, model: &VendorModel, data: &Map<String, Value>) -> ExecResult<(String, Value)> {
        let mut request = self.authorized(self.client.post(&model.model_url)).json(data);
        for (name, value) in &model.headers {
            if let Some(value) = value.as_str() {
                request = request.header(name.as_str(), value);
            }
        }
        let body = send_json(request, self.timing.request_timeout).await?;
        let remote_id = extract_remote_id(&body).ok_or_else(|| {
            ExecError::Decode(format!("could not find task_id in response: {}", body))
        })?;
        Ok((remote_id, body))
    }

    fn query_url(&self, model: &VendorModel, submission: Option<&Value>, remote_id: &str) -> String {
        if let Some(url) = submission
            .and_then(|body| body.get("data"))
            .and_then(|data| non_empty_str(data, "query_url"))
        {
            return url.to_string();
        }
        if !model.query_url_template.is_empty() {
            return fill_template(&model.query_url_template, remote_id);
        }
        warn!(remote_task_id = remote_id, "No query URL for remote task, using default endpoint");
        fill_template(&self.default_query_url, remote_id)
    }
}

#[async_trait]
impl TaskExecutor for VendorExecutor {
    async fn run(&self, task: &Task) -> ExecResult<ExecutionOutput> {
        let input: VendorInput = task.input.decode()?;
        let (Some(data), Some(model)) = (input.data, input.model) else {
            return Err(ExecError::InvalidInput("missing data or model in input".to_string()));
        };
        if model.model_url.is_empty() {
            return Err(ExecError::InvalidInput("missing model_url".to_string()));
        }

        let (remote_id, submission) = match resumed_id(task.remote_task_id.as_deref()) {
            Some(id) => {
                info!(task_id = task.id, remote_task_id = %id, "Resuming vendor task");
                (id, None)
            },
            None => {
                let (id, body) = self.submit(&model, &data).await?;
                info!(task_id = task.id, remote_task_id = %id, "Submitted vendor task");
                record_remote_task_id(self.store.as_ref(), task.id, &id).await;
                (id, Some(body))
            },
        };

        let query_url = self.query_url(&model, submission.as_ref(), &remote_id);
        let file_url = poll_until(
            task.id,
            self.timing,
            || self.authorized(self.client.get(&query_url)),
            classify,
        )
        .await?;

        let ext = url_extension(&file_url, 5).unwrap_or(".mp4");
        let tmp = download(
            &self.client,
            &file_url,
            "vendor_",
            ext,
            self.timing.download_timeout,
        )
        .await?;
        let object_key = format!("tasks/{}{}", remote_id, ext);
        let oss_url = self.uploader.upload(tmp.path(), &object_key).await?;
        info!(task_id = task.id, %oss_url, "Artifact uploaded");

        let mut output = ExecutionOutput::new();
        output.insert(OSS_URL.to_string(), Value::String(oss_url));
        output.insert(ORIGINAL_URL.to_string(), Value::String(file_url));
        output.insert(REMOTE_TASK_ID.to_string(), Value::String(remote_id));
        Ok(output)
    }
}

/// Remote id from a submission response: `data.id`, `data.task_id`, root
/// `id` / `task_id`, then `data` itself when it is a string.
fn extract_remote_id(body: &Value) -> Option<String> {
    let data = body.get("data");
    let nested = data
        .filter(|d| d.is_object())
        .and_then(|d| ["id", "task_id"].iter().find_map(|k| d.get(*k).and_then(id_string)));
    nested
        .or_else(|| ["id", "task_id"].iter().find_map(|k| body.get(*k).and_then(id_string)))
        .or_else(|| data.and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string))
}

/// The object carrying the status: `task`, else `data`, else the root.
fn task_info(body: &Value) -> &Value {
    ["task", "data"]
        .iter()
        .find_map(|k| body.get(*k).filter(|v| v.is_object()))
        .unwrap_or(body)
}

fn artifact_url(body: &Value, info: &Value) -> Option<String> {
    MEDIA_FIELDS
        .iter()
        .find_map(|(array, field)| {
            body.get(*array)
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(|item| non_empty_str(item, field))
        })
        .or_else(|| URL_FIELDS.iter().find_map(|k| non_empty_str(info, k)))
        .map(str::to_string)
}

fn classify(body: &Value) -> ExecResult<Option<String>> {
    let info = task_info(body);
    let raw_status = info.get("status").and_then(Value::as_str).unwrap_or("");
    let status = raw_status.to_uppercase();

    if SUCCESS_STATUSES.contains(&status.as_str()) {
        return artifact_url(body, info).map(Some).ok_or_else(|| {
            ExecError::MissingResult(format!(
                "completed but file url not found in response: {}",
                body
            ))
        });
    }
    if FAILURE_STATUSES.contains(&status.as_str()) {
        let reason = info.get("reason").and_then(Value::as_str).unwrap_or("");
        return Err(ExecError::RemoteFailed(format!(
            "remote task failed: {} (status: {})",
            reason, raw_status
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::RecordingUploader;
    use serde_json::json;

    #[test]
    fn test_remote_id_extraction_order() {
        assert_eq!(extract_remote_id(&json!({"data": {"id": "a", "task_id": "b"}, "id": "c"})).as_deref(), Some("a"));
        assert_eq!(extract_remote_id(&json!({"data": {"task_id": 42}})).as_deref(), Some("42"));
        assert_eq!(extract_remote_id(&json!({"data": {}, "task_id": "root"})).as_deref(), Some("root"));
        assert_eq!(extract_remote_id(&json!({"data": "plain-id"})).as_deref(), Some("plain-id"));
        assert_eq!(extract_remote_id(&json!({"data": {"other": 1}})), None);
    }

    #[test]
    fn test_status_sources() {
        let from_task = json!({"task": {"status": "TASK_STATUS_SUCCEED"}, "videos": [{"video_url": "https://v/1.mp4"}]});
        assert_eq!(classify(&from_task).unwrap().as_deref(), Some("https://v/1.mp4"));

        let from_data = json!({"data": {"status": "succeeded", "file_url": "https://f/1.png"}});
        assert_eq!(classify(&from_data).unwrap().as_deref(), Some("https://f/1.png"));

        let from_root = json!({"status": "processing"});
        assert_eq!(classify(&from_root).unwrap(), None);
    }

    #[test]
    fn test_artifact_lookup_order() {
        let body = json!({
            "task": {"status": "SUCCESS", "url": "https://u"},
            "images": [{"image_url": "https://i"}],
            "audios": [{"audio_url": "https://a"}]
        });
        assert_eq!(classify(&body).unwrap().as_deref(), Some("https://i"));

        let only_output = json!({"task": {"status": "SUCCESS", "output": "https://o"}, "videos": []});
        assert_eq!(classify(&only_output).unwrap().as_deref(), Some("https://o"));

        assert!(matches!(
            classify(&json!({"task": {"status": "COMPLETED"}})),
            Err(ExecError::MissingResult(_))
        ));
    }

    #[test]
    fn test_failure_carries_reason() {
        let err = classify(&json!({"task": {"status": "failed", "reason": "nsfw"}})).unwrap_err();
        assert_eq!(err.to_string(), "remote task failed: nsfw (status: failed)");
        assert_eq!(err.kind(), broker_domain::ErrorKind::RemoteFailure);
    }

    #[test]
    fn test_query_url_resolution() {
        let executor = VendorExecutor::new(Arc::new(RecordingUploader::new("https://cdn")), "key")
            .with_default_query_url("https://vendor/result?id=%s");
        let model = VendorModel::default();

        let submission = json!({"data": {"id": "x", "query_url": "https://vendor/q/x"}});
        assert_eq!(executor.query_url(&model, Some(&submission), "x"), "https://vendor/q/x");

        let templated = VendorModel { query_url_template: "https://m/%s".into(), ..Default::default() };
        assert_eq!(executor.query_url(&templated, None, "x"), "https://m/x");

        assert_eq!(executor.query_url(&model, None, "x"), "https://vendor/result?id=x");
    }
}
