//! Marigold Queue
//!
//! A durable, lease-based queue of activity tasks.
//!
//! Delivery is at-least-once. [`TaskQueue::poll`] leases ready tasks by
//! pushing their `visible_at` forward; a worker that dies without reporting
//! leaves the task to become visible again once the lease lapses. After
//! `max_deliveries` leases the task is no longer handed out and
//! [`TaskQueue::reap_expired`] retires it as failed.
//!
//! Completed and failed tasks stay in the queue as retired records. The
//! executor reads a step's result from them, and their idempotency keys
//! keep a repeated enqueue of the same attempt a no-op.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;
pub use types::{NewTask, Task, TaskStatus, idempotency_key};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Error message recorded on a task whose leases ran out.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// The requested task was not found.
  #[error("task not found: {0}")]
  NotFound(String),

  /// The task already has a final outcome (or was cancelled). Reports
  /// against it are rejected.
  #[error("task {task_id} is already {status}")]
  Retired { task_id: String, status: TaskStatus },

  /// A stored record could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for activity tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
  /// Enqueue a task. If a task with the same idempotency key exists, that
  /// task is returned unchanged.
  async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError>;

  /// Lease up to `max_tasks` ready tasks from `queue`, oldest first. Each
  /// returned task is handed to exactly one caller.
  async fn poll(
    &self,
    queue: &str,
    max_tasks: usize,
    lease: Duration,
  ) -> Result<Vec<Task>, QueueError>;

  /// Extend the lease of a pending task to `now + lease`.
  async fn heartbeat(&self, task_id: &str, lease: Duration) -> Result<Task, QueueError>;

  /// Retire a task as completed with `output`.
  async fn complete(&self, task_id: &str, output: Value) -> Result<Task, QueueError>;

  /// Retire a task as failed.
  async fn fail(&self, task_id: &str, error: &str, retryable: bool) -> Result<Task, QueueError>;

  /// Get a task by ID.
  async fn get(&self, task_id: &str) -> Result<Task, QueueError>;

  /// Get a task by idempotency key.
  async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Task>, QueueError>;

  /// Retire every pending task whose final lease lapsed at or before `now`
  /// as failed and non-retryable. Returns the retired tasks.
  async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError>;

  /// Retire every pending task of an instance as cancelled. Workers already
  /// running one are not interrupted, but their report will be rejected.
  async fn cancel_pending(&self, instance_id: &str) -> Result<u64, QueueError>;
}

pub(crate) fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(lease)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
