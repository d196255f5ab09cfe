//! Task queue: FIFO of task ids between submitters and workers.
//!
//! Delivery is at-least-once. A consumer that crashes after popping loses
//! nothing durable: the task row still says where it was, and startup
//! recovery re-enqueues or re-adopts it.

use async_trait::async_trait;
use broker_domain::TaskId;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::KvResult;

/// List key of the durable queue.
pub const TASK_QUEUE_KEY: &str = "task_queue";

/// Port for the task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task id to the tail.
    async fn push(&self, task_id: TaskId) -> KvResult<()>;

    /// Take the head, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` when the wait elapsed. Callers loop on this to block
    /// indefinitely while staying cancellable.
    async fn pop(&self, timeout: Duration) -> KvResult<Option<TaskId>>;

    /// Number of queued ids.
    async fn len(&self) -> KvResult<usize>;
}

/// In-process queue for tests and single-node development.
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<TaskId>>,
    available: Notify,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the queued ids, head first.
    pub async fn snapshot(&self) -> Vec<TaskId> {
        self.items.lock().await.iter().copied().collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task_id: TaskId) -> KvResult<()> {
        self.items.lock().await.push_back(task_id);
        self.available.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> KvResult<Option<TaskId>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(id) = self.items.lock().await.pop_front() {
                return Ok(Some(id));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> KvResult<usize> {
        Ok(self.items.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new();
        for id in [3, 1, 2] {
            queue.push(id).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), Some(3));
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), Some(1));
        assert_eq!(queue.snapshot().await, vec![2]);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.pop(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), Some(42));
    }
}
