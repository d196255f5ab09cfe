//! Generic remote API executor (`remote_api`).
//!
//! Input fields:
//! - `target_url` (required): submission endpoint
//! - `method`: submission method, POST by default
//! - `payload`: JSON body of the submission
//! - `query_url_template`: status endpoint; `%s` is replaced by the remote id.
//!   Defaults to `<target_url>/<remote id>`
//! - `result_file_key`: status field holding the artifact URL (`file_url`)

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use broker_domain::Task;
use broker_store::Store;

use crate::error::{ExecError, ExecResult};
use crate::http::{download, fill_template, id_string, non_empty_str, send_json, url_extension};
use crate::poll::{poll_until, record_remote_task_id, resumed_id};
use crate::ports::{
    ExecutionOutput, PollTiming, TaskExecutor, Uploader, ORIGINAL_URL, OSS_URL, REMOTE_TASK_ID,
};

const SUCCESS_STATUSES: [&str; 3] = ["completed", "success", "succeeded"];
const FAILURE_STATUSES: [&str; 2] = ["failed", "error"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoteApiInput {
    target_url: String,
    method: String,
    payload: Value,
    query_url_template: String,
    result_file_key: String,
}

impl RemoteApiInput {
    fn query_url(&self, remote_id: &str) -> String {
        if self.query_url_template.is_empty() {
            format!("{}/{}", self.target_url.trim_end_matches('/'), remote_id)
        } else {
            fill_template(&self.query_url_template, remote_id)
        }
    }

    fn result_key(&self) -> &str {
        if self.result_file_key.is_empty() {
            "file_url"
        } else {
            &self.result_file_key
        }
    }
}

/// Submits to an arbitrary JSON API, polls it, and re-hosts the artifact.
pub struct RemoteApiExecutor {
    client: Client,
    uploader: Arc<dyn Uploader>,
    store: Option<Arc<dyn Store>>,
    api_key: String,
    timing: PollTiming,
}

impl RemoteApiExecutor {
    /// Create an executor sending `Authorization: Bearer <api_key>`.
    pub fn new(uploader: Arc<dyn Uploader>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            uploader,
            store: None,
            api_key: api_key.into(),
            timing: PollTiming::remote_api(),
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

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
    }

    async fn submit(&self, input: &RemoteApiInput) -> ExecResult<String> {
        let method = if input.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(input.method.to_uppercase().as_bytes())
                .map_err(|_| ExecError::InvalidInput(format!("invalid method: {}", input.method)))?
        };
        let payload = if input.payload.is_null() { json!({}) } else { input.payload.clone() };

        let request = self.authorized(self.client.request(method, &input.target_url)).json(&payload);
        let body = send_json(request, self.timing.request_timeout).await?;

        ["task_id", "id"]
            .iter()
            .find_map(|key| body.get(*key).and_then(id_string))
            .ok_or_else(|| ExecError::Decode("could not find task_id in response".to_string()))
    }
}

#[async_trait]
impl TaskExecutor for RemoteApiExecutor {
    async fn run(&self, task: &Task) -> ExecResult<ExecutionOutput> {
        let input: RemoteApiInput = task.input.decode()?;
        if input.target_url.is_empty() {
            return Err(ExecError::InvalidInput("missing target_url".to_string()));
        }

        let remote_id = match resumed_id(task.remote_task_id.as_deref()) {
            Some(id) => {
                info!(task_id = task.id, remote_task_id = %id, "Resuming remote task");
                id
            },
            None => {
                let id = self.submit(&input).await?;
                info!(task_id = task.id, remote_task_id = %id, "Submitted remote task");
                record_remote_task_id(self.store.as_ref(), task.id, &id).await;
                id
            },
        };

        let query_url = input.query_url(&remote_id);
        let result_key = input.result_key();
        let file_url = poll_until(
            task.id,
            self.timing,
            || self.authorized(self.client.get(&query_url)),
            |body| classify(body, result_key),
        )
        .await?;

        let ext = url_extension(&file_url, 9).unwrap_or("");
        let tmp = download(
            &self.client,
            &file_url,
            &format!("task_{}_", task.id),
            ext,
            self.timing.download_timeout,
        )
        .await?;
        let basename = tmp
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("task_{}{}", task.id, ext));
        let object_key = format!("tasks/{}/{}", task.id, basename);
        let oss_url = self.uploader.upload(tmp.path(), &object_key).await?;
        info!(task_id = task.id, %oss_url, "Artifact uploaded");

        let mut output = ExecutionOutput::new();
        output.insert(OSS_URL.to_string(), Value::String(oss_url));
        output.insert(ORIGINAL_URL.to_string(), Value::String(file_url));
        output.insert(REMOTE_TASK_ID.to_string(), Value::String(remote_id));
        Ok(output)
    }
}

fn classify(body: &Value, result_key: &str) -> ExecResult<Option<String>> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("").to_lowercase();
    if SUCCESS_STATUSES.contains(&status.as_str()) {
        return [result_key, "result_url", "url"]
            .iter()
            .find_map(|key| non_empty_str(body, key))
            .map(|url| Some(url.to_string()))
            .ok_or_else(|| ExecError::MissingResult("completed but file url not found".to_string()));
    }
    if FAILURE_STATUSES.contains(&status.as_str()) {
        return Err(ExecError::RemoteFailed(format!("remote task failed: {}", body)));
    }
    Ok(None)
}
