//! Generation tasks and their lifecycle state machine.
//!
//! ```text
//! PendingAudit ──approve──► PendingExecution ──worker──► Processing ──► Completed
//!                                  ▲                         │
//!                                  └────── retry ◄───────────┤
//!                                                            └──► Failed
//! any non-terminal ──cancel──► Cancelled
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::value_objects::{AccountId, DomainError, TaskId, DEFAULT_MAX_RETRIES};

// =============================================================================
// Status
// =============================================================================

/// Task status. The numeric codes are persisted and their order matters:
/// `status >= Processing` freezes the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i16)]
pub enum TaskStatus {
    /// Waiting for moderation
    PendingAudit = 1,
    /// Queued for a worker
    PendingExecution = 2,
    /// Claimed by a worker or tracked by the polling supervisor
    Processing = 3,
    /// Artifact available
    Completed = 4,
    /// Retries exhausted
    Failed = 5,
    /// Cancelled by the user
    Cancelled = 6,
}

impl TaskStatus {
    /// Persisted numeric code.
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Parse a persisted numeric code.
    pub fn from_code(code: i16) -> Result<Self, DomainError> {
        match code {
            1 => Ok(TaskStatus::PendingAudit),
            2 => Ok(TaskStatus::PendingExecution),
            3 => Ok(TaskStatus::Processing),
            4 => Ok(TaskStatus::Completed),
            5 => Ok(TaskStatus::Failed),
            6 => Ok(TaskStatus::Cancelled),
            other => Err(DomainError::unknown("task status", other)),
        }
    }

    /// Completed, Failed or Cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::PendingAudit => "pending_audit",
            TaskStatus::PendingExecution => "pending_execution",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.code())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i16::deserialize(deserializer)?;
        TaskStatus::from_code(code).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Input
// =============================================================================

/// Opaque task input: the JSON object the submitter sent, kept as bytes.
///
/// The core only peeks at routing keys; each executor decodes its own schema
/// with [`TaskInput::decode`].
#[derive(Clone, PartialEq, Eq)]
pub struct TaskInput(Vec<u8>);

impl TaskInput {
    /// Wrap raw JSON bytes. The payload must be a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DomainError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DomainError::InvalidInput(format!("input is not valid JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Encode a JSON value. The value must be an object.
    pub fn from_value(value: &Value) -> Result<Self, DomainError> {
        if !value.is_object() {
            return Err(DomainError::InvalidInput("input must be a JSON object".to_string()));
        }
        serde_json::to_vec(value)
            .map(Self)
            .map_err(|e| DomainError::InvalidInput(e.to_string()))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the whole input as JSON.
    pub fn to_value(&self) -> Result<Value, DomainError> {
        serde_json::from_slice(&self.0).map_err(|e| DomainError::InvalidInput(e.to_string()))
    }

    /// Decode into an executor-specific schema.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        serde_json::from_slice(&self.0).map_err(|e| DomainError::InvalidInput(e.to_string()))
    }

    /// Top-level field, if present and non-null.
    pub fn field(&self, key: &str) -> Option<Value> {
        self.to_value()
            .ok()
            .and_then(|mut v| v.get_mut(key).map(Value::take))
            .filter(|v| !v.is_null())
    }

    /// Whether the top-level key is present, whatever its value.
    pub fn has_key(&self, key: &str) -> bool {
        self.to_value().ok().is_some_and(|v| v.get(key).is_some())
    }

    /// Top-level string field, if present.
    pub fn str_field(&self, key: &str) -> Option<String> {
        match self.field(key)? {
            Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

impl fmt::Debug for TaskInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskInput({})", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for TaskInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().map_err(serde::ser::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        TaskInput::from_value(&value).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Task
// =============================================================================

/// Outcome of recording an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Budget left: task is back at PendingExecution and must be re-enqueued
    Retry,
    /// Budget exhausted: task is Failed and its cost must be refunded
    Exhausted,
}

/// A generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id
    pub id: TaskId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Opaque input blob
    pub input: TaskInput,
    /// Submitting account
    pub creator_id: AccountId,
    /// Submitting account's display name
    pub creator_name: String,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Re-hosted artifact URL
    pub result_url: Option<String>,
    /// Retries consumed
    pub retry_count: i32,
    /// Retry budget
    pub max_retries: i32,
    /// Last error message(s)
    pub error_log: Option<String>,
    /// Identifier assigned by the remote provider
    pub remote_task_id: Option<String>,
    /// Amount charged at submission
    pub cost: Decimal,
}

impl Task {
    fn guard(&self, allowed: bool, message: &str) -> Result<(), DomainError> {
        if allowed {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition(format!(
                "{message} (task {}, status {})",
                self.id, self.status
            )))
        }
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Moderation approval: PendingAudit → PendingExecution.
    pub fn approve(&mut self) -> Result<(), DomainError> {
        self.guard(self.status == TaskStatus::PendingAudit, "task is not pending audit")?;
        self.set_status(TaskStatus::PendingExecution);
        Ok(())
    }

    /// User cancellation: any non-terminal status → Cancelled.
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        self.guard(!self.status.is_terminal(), "task can no longer be cancelled")?;
        self.set_status(TaskStatus::Cancelled);
        Ok(())
    }

    /// Fails once the task has reached Processing.
    pub fn ensure_input_mutable(&self) -> Result<(), DomainError> {
        self.guard(
            self.status < TaskStatus::Processing,
            "task input cannot be changed once processing has started",
        )
    }

    /// Replace the input while the task is still pending.
    pub fn replace_input(&mut self, input: TaskInput) -> Result<(), DomainError> {
        self.ensure_input_mutable()?;
        self.input = input;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Worker claim: PendingExecution → Processing.
    pub fn begin_processing(&mut self) -> Result<(), DomainError> {
        self.guard(
            self.status == TaskStatus::PendingExecution,
            "task is not pending execution",
        )?;
        self.set_status(TaskStatus::Processing);
        Ok(())
    }

    /// Terminal success. Returns `false` (and leaves the task untouched) when
    /// the task was cancelled while the executor was running.
    pub fn complete(&mut self, result_url: impl Into<String>) -> bool {
        if self.status == TaskStatus::Cancelled {
            return false;
        }
        self.result_url = Some(result_url.into());
        self.set_status(TaskStatus::Completed);
        true
    }

    /// Record an execution failure against the retry budget.
    pub fn record_failure(&mut self, message: impl Into<String>) -> FailureDisposition {
        self.error_log = Some(message.into());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.set_status(TaskStatus::PendingExecution);
            FailureDisposition::Retry
        } else {
            self.set_status(TaskStatus::Failed);
            FailureDisposition::Exhausted
        }
    }

    /// Terminal failure regardless of the retry budget.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.error_log = Some(message.into());
        self.set_status(TaskStatus::Failed);
    }

    /// Append a line to the error log.
    pub fn append_error(&mut self, message: &str) {
        self.error_log = Some(match self.error_log.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}; {message}"),
            _ => message.to_string(),
        });
        self.updated_at = Utc::now();
    }

    /// User retry of a failed task: Failed → PendingExecution with a fresh
    /// budget. The remote id is dropped so the next run submits a new job.
    pub fn reset_for_retry(&mut self) -> Result<(), DomainError> {
        self.guard(self.status == TaskStatus::Failed, "only failed tasks can be retried")?;
        self.retry_count = 0;
        self.error_log = None;
        self.result_url = None;
        self.remote_task_id = None;
        self.set_status(TaskStatus::PendingExecution);
        Ok(())
    }

    /// Crash recovery for a stranded task with no remote id: Processing → PendingExecution.
    pub fn rewind(&mut self) -> Result<(), DomainError> {
        self.guard(self.status == TaskStatus::Processing, "task is not processing")?;
        self.set_status(TaskStatus::PendingExecution);
        Ok(())
    }
}

/// Data required to insert a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Opaque input blob
    pub input: TaskInput,
    /// Submitting account
    pub creator_id: AccountId,
    /// Submitting account's display name
    pub creator_name: String,
    /// Initial status
    pub status: TaskStatus,
    /// Retry budget
    pub max_retries: i32,
    /// Amount charged
    pub cost: Decimal,
}

impl NewTask {
    /// A task entering moderation, or going straight to execution when
    /// `auto_audit` is set.
    pub fn submitted(
        input: TaskInput,
        creator_id: AccountId,
        creator_name: impl Into<String>,
        cost: Decimal,
        auto_audit: bool,
    ) -> Self {
        Self {
            input,
            creator_id,
            creator_name: creator_name.into(),
            status: if auto_audit {
                TaskStatus::PendingExecution
            } else {
                TaskStatus::PendingAudit
            },
            max_retries: DEFAULT_MAX_RETRIES,
            cost,
        }
    }

    /// Build the persisted task once an id is assigned.
    pub fn into_task(self, id: TaskId, now: DateTime<Utc>) -> Task {
        Task {
            id,
            created_at: now,
            updated_at: now,
            input: self.input,
            creator_id: self.creator_id,
            creator_name: self.creator_name,
            status: self.status,
            result_url: None,
            retry_count: 0,
            max_retries: self.max_retries,
            error_log: None,
            remote_task_id: None,
            cost: self.cost,
        }
    }
}

/// Listing filter for tasks.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    /// Only tasks created by this account
    pub creator_id: Option<AccountId>,
    /// Only tasks in this status
    pub status: Option<TaskStatus>,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub limit: u32,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self { creator_id: None, status: None, page: 1, limit: 20 }
    }
}

impl TaskFilter {
    /// Tasks of one creator.
    pub fn by_creator(creator_id: AccountId) -> Self {
        Self { creator_id: Some(creator_id), ..Self::default() }
    }

    /// Restrict to a status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Row offset for the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }

    /// Whether a task passes the non-paging criteria.
    pub fn matches(&self, task: &Task) -> bool {
        self.creator_id.map_or(true, |c| task.creator_id == c)
            && self.status.map_or(true, |s| task.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn task(status: TaskStatus) -> Task {
        let input = TaskInput::from_value(&json!({"model_id": 1, "prompt": "a cat"})).unwrap();
        let mut task =
            NewTask::submitted(input, 7, "alice", dec!(10), false).into_task(1, Utc::now());
        task.status = status;
        task
    }

    #[test]
    fn test_status_codes_are_ordered() {
        assert!(TaskStatus::PendingAudit < TaskStatus::PendingExecution);
        assert!(TaskStatus::Processing < TaskStatus::Completed);
        assert!(TaskStatus::Failed < TaskStatus::Cancelled);
        for code in 1..=6 {
            assert_eq!(TaskStatus::from_code(code).unwrap().code(), code);
        }
        assert!(TaskStatus::from_code(9).is_err());
    }

    #[test]
    fn test_auto_audit_sets_initial_status() {
        let input = TaskInput::from_value(&json!({})).unwrap();
        assert_eq!(
            NewTask::submitted(input.clone(), 1, "a", dec!(0), true).status,
            TaskStatus::PendingExecution
        );
        let pending = NewTask::submitted(input, 1, "a", dec!(0), false);
        assert_eq!(pending.status, TaskStatus::PendingAudit);
        assert_eq!(pending.max_retries, 3);
    }

    #[test]
    fn test_approve_requires_pending_audit() {
        let mut t = task(TaskStatus::PendingAudit);
        t.approve().unwrap();
        assert_eq!(t.status, TaskStatus::PendingExecution);

        let err = t.approve().unwrap_err();
        assert!(err.to_string().contains("task is not pending audit"));
    }

    #[test]
    fn test_input_frozen_from_processing() {
        let replacement = TaskInput::from_value(&json!({"prompt": "a dog"})).unwrap();
        for status in [TaskStatus::PendingAudit, TaskStatus::PendingExecution] {
            assert!(task(status).replace_input(replacement.clone()).is_ok());
        }
        for status in [
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(matches!(
                task(status).replace_input(replacement.clone()),
                Err(DomainError::InvalidStateTransition(_))
            ));
        }
    }

    #[test]
    fn test_cancel_rejected_for_terminal() {
        assert!(task(TaskStatus::Processing).cancel().is_ok());
        assert!(task(TaskStatus::Completed).cancel().is_err());
        assert!(task(TaskStatus::Failed).cancel().is_err());
        assert!(task(TaskStatus::Cancelled).cancel().is_err());
    }

    #[test]
    fn test_complete_does_not_override_cancellation() {
        let mut t = task(TaskStatus::Cancelled);
        assert!(!t.complete("https://cdn/x.mp4"));
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.result_url.is_none());
    }

    #[test]
    fn test_failure_budget() {
        let mut t = task(TaskStatus::Processing);
        for attempt in 1..=3 {
            assert_eq!(t.record_failure("boom"), FailureDisposition::Retry);
            assert_eq!(t.retry_count, attempt);
            assert_eq!(t.status, TaskStatus::PendingExecution);
            t.status = TaskStatus::Processing;
        }
        assert_eq!(t.record_failure("boom"), FailureDisposition::Exhausted);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error_log.as_deref(), Some("boom"));
    }

    #[test]
    fn test_reset_for_retry() {
        let mut t = task(TaskStatus::Failed);
        t.retry_count = 3;
        t.error_log = Some("x".into());
        t.remote_task_id = Some("remote-9".into());
        t.reset_for_retry().unwrap();
        assert_eq!(t.retry_count, 0);
        assert!(t.error_log.is_none());
        assert!(t.remote_task_id.is_none());
        assert_eq!(t.status, TaskStatus::PendingExecution);
        assert!(task(TaskStatus::Completed).reset_for_retry().is_err());
    }

    #[test]
    fn test_append_error() {
        let mut t = task(TaskStatus::Failed);
        t.error_log = Some("remote task failed".into());
        t.append_error("Refund failed: db down");
        assert_eq!(t.error_log.as_deref(), Some("remote task failed; Refund failed: db down"));
    }

    #[test]
    fn test_input_must_be_object() {
        assert!(TaskInput::from_slice(b"[1,2]").is_err());
        assert!(TaskInput::from_slice(b"not json").is_err());
        let input = TaskInput::from_slice(br#"{"executor":"remote_api","n":null}"#).unwrap();
        assert_eq!(input.str_field("executor").as_deref(), Some("remote_api"));
        assert!(input.field("n").is_none());
        assert!(input.field("missing").is_none());
        assert!(input.has_key("n"));
        assert!(!input.has_key("missing"));
    }
}
