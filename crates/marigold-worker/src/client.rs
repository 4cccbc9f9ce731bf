use std::time::Duration;

use async_trait::async_trait;
use marigold_queue::Task;
use serde_json::Value;

use crate::activity::ActivityError;

/// Errors returned by a [`WorkerClient`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  /// The task was retired (completed elsewhere, reaped or cancelled) while
  /// this worker held it. The worker's result is discarded.
  #[error("task {task_id} is no longer held by this worker: {reason}")]
  LeaseLost { task_id: String, reason: String },

  /// A transient failure talking to the engine. Retried with backoff.
  #[error("worker client error: {0}")]
  Client(String),
}

/// The worker protocol: how a pool leases tasks and reports their outcome.
#[async_trait]
pub trait WorkerClient: Send + Sync {
  async fn poll(
    &self,
    queue: &str,
    max_tasks: usize,
    lease: Duration,
  ) -> Result<Vec<Task>, WorkerError>;

  async fn heartbeat(&self, task_id: &str, lease: Duration) -> Result<(), WorkerError>;

  async fn complete(&self, task_id: &str, output: Value) -> Result<(), WorkerError>;

  async fn fail(&self, task_id: &str, error: &ActivityError) -> Result<(), WorkerError>;
}
