use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a task.
///
/// Only `Pending` tasks are ever handed to workers. The other statuses are
/// retired records kept so their idempotency keys keep deduplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  Completed,
  Failed,
  Cancelled,
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Build the idempotency key of one attempt of one step of one instance.
pub fn idempotency_key(instance_id: &str, step_index: u32, attempt: u32) -> String {
  format!("{}:{}:{}", instance_id, step_index, attempt)
}

/// A unit of activity work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub task_id: String,
  pub queue: String,
  pub instance_id: String,
  pub step_index: u32,
  pub activity_name: String,
  pub input: Value,
  /// Attempt number of the owning step, starting at 1.
  pub attempt: u32,
  pub idempotency_key: String,
  /// The task can be polled once `visible_at <= now`. Polling pushes it
  /// forward by the lease duration.
  pub visible_at: DateTime<Utc>,
  /// How many times the task has been leased.
  pub deliveries: u32,
  pub max_deliveries: u32,
  pub status: TaskStatus,
  pub output: Option<Value>,
  pub error: Option<String>,
  /// Whether a failure may be retried as a new attempt.
  pub retryable: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn is_pending(&self) -> bool {
    self.status == TaskStatus::Pending
  }

  /// Whether a worker may lease this task at `now`.
  pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
    self.is_pending() && self.visible_at <= now && self.deliveries < self.max_deliveries
  }

  /// Whether the task's final lease lapsed without a reported result.
  pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
    self.is_pending() && self.visible_at <= now && self.deliveries >= self.max_deliveries
  }
}

/// Request to enqueue a task.
#[derive(Debug, Clone)]
pub struct NewTask {
  pub queue: String,
  pub instance_id: String,
  pub step_index: u32,
  pub activity_name: String,
  pub input: Value,
  pub attempt: u32,
  pub visible_at: DateTime<Utc>,
  /// Leases allowed before the task is retired as failed. The executor
  /// passes the step's attempt budget.
  pub max_deliveries: u32,
}

impl NewTask {
  pub fn idempotency_key(&self) -> String {
    idempotency_key(&self.instance_id, self.step_index, self.attempt)
  }

  pub(crate) fn into_task(self, task_id: String, now: DateTime<Utc>) -> Task {
    let idempotency_key = self.idempotency_key();
    Task {
      task_id,
      queue: self.queue,
      instance_id: self.instance_id,
      step_index: self.step_index,
      activity_name: self.activity_name,
      input: self.input,
      attempt: self.attempt,
      idempotency_key,
      visible_at: self.visible_at,
      deliveries: 0,
      max_deliveries: self.max_deliveries.max(1),
      status: TaskStatus::Pending,
      output: None,
      error: None,
      retryable: true,
      created_at: now,
      updated_at: now,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_idempotency_key_is_per_attempt() {
    assert_eq!(idempotency_key("abc", 1, 2), "abc:1:2");
    assert_ne!(idempotency_key("abc", 1, 1), idempotency_key("abc", 1, 2));
    assert_ne!(idempotency_key("abc", 0, 1), idempotency_key("abc", 1, 1));
  }
}
