//! In-process mock of an asynchronous generation provider.
//!
//! Routes:
//! - `POST /v1/tasks`: create, answers `{"data":{"id":"remote-<n>"}}`
//! - `GET /v1/tasks/:id`: status by path
//! - `GET /v3/async/task-result?task_id=<id>`: status by query string
//! - `POST /api/jobs`: create, answers `{"task_id":"job-<n>"}`
//! - `GET /api/jobs/:id`: flat status `{"status", "file_url"}`
//! - `GET /files/:name`: artifact bytes
//!
//! The `/v1` and `/v3` routes speak the vendor shapes (`data.id`,
//! `task.status`, `videos[0].video_url`); `/api/jobs` speaks the generic
//! remote API shape with the id and status at the root. Each status query
//! consumes one scripted status; once the script is empty the final status
//! repeats.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::Result;

/// Bytes served for every artifact.
pub const ARTIFACT_BYTES: &[u8] = b"generated-artifact";

struct MockState {
    base_url: String,
    script: Mutex<VecDeque<String>>,
    final_status: Mutex<String>,
    creates: AtomicUsize,
    queries: AtomicUsize,
    downloads: AtomicUsize,
    last_authorization: Mutex<Option<String>>,
    last_create_body: Mutex<Option<Value>>,
}

/// Running mock provider; the server stops when this is dropped.
pub struct MockVendor {
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockVendor {
    /// Bind an ephemeral port and start serving.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let state = Arc::new(MockState {
            base_url: format!("http://{}", addr),
            script: Mutex::new(VecDeque::new()),
            final_status: Mutex::new("succeeded".to_string()),
            creates: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            last_authorization: Mutex::new(None),
            last_create_body: Mutex::new(None),
        });

        let router = Router::new()
            .route("/v1/tasks", post(create))
            .route("/v1/tasks/:id", get(status_by_path))
            .route("/v3/async/task-result", get(status_by_query))
            .route("/api/jobs", post(create_job))
            .route("/api/jobs/:id", get(job_status))
            .route("/files/:name", get(file))
            .with_state(state.clone());

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self { state, handle })
    }

    /// `http://127.0.0.1:<port>`
    pub fn base_url(&self) -> &str {
        &self.state.base_url
    }

    /// Submission endpoint.
    pub fn submit_url(&self) -> String {
        format!("{}/v1/tasks", self.base_url())
    }

    /// Status endpoint template with `%s` for the remote id.
    pub fn query_template(&self) -> String {
        format!("{}/v1/tasks/%s", self.base_url())
    }

    /// Vendor-style task-result endpoint template.
    pub fn task_result_template(&self) -> String {
        format!("{}/v3/async/task-result?task_id=%s", self.base_url())
    }

    /// Generic remote API submission endpoint; its status endpoint is
    /// `<jobs_url>/<id>`.
    pub fn jobs_url(&self) -> String {
        format!("{}/api/jobs", self.base_url())
    }

    /// URL of an artifact.
    pub fn file_url(&self, name: &str) -> String {
        format!("{}/files/{}", self.base_url(), name)
    }

    /// Queue statuses returned by the next status queries.
    pub fn script(&self, statuses: &[&str]) {
        let mut script = self.state.script.lock().unwrap();
        script.extend(statuses.iter().map(|s| s.to_string()));
    }

    /// Status returned once the script is exhausted.
    pub fn set_final_status(&self, status: &str) {
        *self.state.final_status.lock().unwrap() = status.to_string();
    }

    /// Number of create calls.
    pub fn create_calls(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    /// Number of status queries.
    pub fn query_calls(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// Number of artifact downloads.
    pub fn download_calls(&self) -> usize {
        self.state.downloads.load(Ordering::SeqCst)
    }

    /// `Authorization` header of the last create call.
    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().unwrap().clone()
    }

    /// JSON body of the last create call.
    pub fn last_create_body(&self) -> Option<Value> {
        self.state.last_create_body.lock().unwrap().clone()
    }
}

impl Drop for MockVendor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn record_create(state: &MockState, headers: &HeaderMap, body: Value) -> usize {
    *state.last_authorization.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_create_body.lock().unwrap() = Some(body);
    state.creates.fetch_add(1, Ordering::SeqCst) + 1
}

async fn create(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let n = record_create(&state, &headers, body);
    Json(json!({ "data": { "id": format!("remote-{}", n) } }))
}

async fn create_job(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let n = record_create(&state, &headers, body);
    Json(json!({ "task_id": format!("job-{}", n) }))
}

async fn job_status(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Json<Value> {
    let vendor_body = next_status(&state, &id);
    let mut body = json!({ "status": vendor_body["status"] });
    if let Some(url) = vendor_body.get("file_url") {
        body["file_url"] = url.clone();
    }
    Json(body)
}

async fn status_by_path(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    Json(next_status(&state, &id))
}

async fn status_by_query(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let id = params.get("task_id").cloned().unwrap_or_default();
    Json(next_status(&state, &id))
}

async fn file(State(state): State<Arc<MockState>>, Path(_name): Path<String>) -> impl IntoResponse {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "video/mp4")], ARTIFACT_BYTES)
}

fn next_status(state: &MockState, id: &str) -> Value {
    state.queries.fetch_add(1, Ordering::SeqCst);
    let status = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.final_status.lock().unwrap().clone());

    let mut body = json!({
        "status": status,
        "task": { "task_id": id, "status": status, "reason": "mock failure" }
    });
    if matches!(status.to_lowercase().as_str(), "succeeded" | "success" | "completed") {
        let url = format!("{}/files/{}.mp4", state.base_url, id);
        body["file_url"] = json!(url);
        body["videos"] = json!([{ "video_url": url }]);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_vendor_scripted_statuses() {
        let vendor = MockVendor::start().await.unwrap();
        vendor.script(&["processing"]);
        let client = reqwest::Client::new();

        let created: Value = client
            .post(vendor.submit_url())
            .bearer_auth("k")
            .json(&json!({"prompt": "x"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["data"]["id"], "remote-1");
        assert_eq!(vendor.last_authorization().as_deref(), Some("Bearer k"));

        let url = vendor.query_template().replace("%s", "remote-1");
        let first: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(first["status"], "processing");
        let second: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(second["task"]["status"], "succeeded");

        let file_url = second["file_url"].as_str().unwrap();
        let bytes = client.get(file_url).send().await.unwrap().bytes().await.unwrap();
        assert_eq!(&bytes[..], ARTIFACT_BYTES);
        assert_eq!((vendor.create_calls(), vendor.query_calls(), vendor.download_calls()), (1, 2, 1));
    }

    #[tokio::test]
    async fn test_mock_jobs_route_uses_root_fields() {
        let vendor = MockVendor::start().await.unwrap();
        let client = reqwest::Client::new();

        let created: Value = client
            .post(vendor.jobs_url())
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created, json!({"task_id": "job-1"}));

        let url = format!("{}/job-1", vendor.jobs_url());
        let status: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["status"], "succeeded");
        assert_eq!(status["file_url"], json!(vendor.file_url("job-1.mp4")));
        assert!(status.get("task").is_none());
    }
}
