use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{NewTask, Task, TaskStatus};
use crate::{LEASE_EXPIRED, QueueError, TaskQueue, lease_until};

#[derive(Default)]
struct Inner {
  tasks: HashMap<String, Task>,
  /// idempotency key -> task id
  keys: HashMap<String, String>,
}

impl Inner {
  fn pending_mut(&mut self, task_id: &str) -> Result<&mut Task, QueueError> {
    let task = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
    if !task.is_pending() {
      return Err(QueueError::Retired {
        task_id: task_id.to_string(),
        status: task.status,
      });
    }
    Ok(task)
  }
}

/// In-memory task queue.
#[derive(Default)]
pub struct MemoryQueue {
  inner: Mutex<Inner>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
  async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError> {
    let mut inner = self.inner.lock().await;
    let key = task.idempotency_key();

    if let Some(existing) = inner.keys.get(&key).and_then(|id| inner.tasks.get(id)) {
      return Ok(existing.clone());
    }

    let task = task.into_task(Uuid::new_v4().to_string(), Utc::now());
    inner.keys.insert(key, task.task_id.clone());
    inner.tasks.insert(task.task_id.clone(), task.clone());
    Ok(task)
  }

  async fn poll(
    &self,
    queue: &str,
    max_tasks: usize,
    lease: Duration,
  ) -> Result<Vec<Task>, QueueError> {
    let mut inner = self.inner.lock().await;
    let now = Utc::now();

    let mut ready: Vec<&mut Task> = inner
      .tasks
      .values_mut()
      .filter(|t| t.queue == queue && t.is_ready(now))
      .collect();
    ready.sort_by(|a, b| {
      a.visible_at
        .cmp(&b.visible_at)
        .then(a.created_at.cmp(&b.created_at))
    });

    let leased = ready
      .into_iter()
      .take(max_tasks)
      .map(|task| {
        task.visible_at = lease_until(now, lease);
        task.deliveries += 1;
        task.updated_at = now;
        task.clone()
      })
      .collect();

    Ok(leased)
  }

  async fn heartbeat(&self, task_id: &str, lease: Duration) -> Result<Task, QueueError> {
    let mut inner = self.inner.lock().await;
    let now = Utc::now();
    let task = inner.pending_mut(task_id)?;
    task.visible_at = lease_until(now, lease);
    task.updated_at = now;
    Ok(task.clone())
  }

  async fn complete(&self, task_id: &str, output: Value) -> Result<Task, QueueError> {
    let mut inner = self.inner.lock().await;
    let task = inner.pending_mut(task_id)?;
    task.status = TaskStatus::Completed;
    task.output = Some(output);
    task.updated_at = Utc::now();
    Ok(task.clone())
  }

  async fn fail(&self, task_id: &str, error: &str, retryable: bool) -> Result<Task, QueueError> {
    let mut inner = self.inner.lock().await;
    let task = inner.pending_mut(task_id)?;
    task.status = TaskStatus::Failed;
    task.error = Some(error.to_string());
    task.retryable = retryable;
    task.updated_at = Utc::now();
    Ok(task.clone())
  }

  async fn get(&self, task_id: &str) -> Result<Task, QueueError> {
    let inner = self.inner.lock().await;
    inner
      .tasks
      .get(task_id)
      .cloned()
      .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
  }

  async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Task>, QueueError> {
    let inner = self.inner.lock().await;
    Ok(
      inner
        .keys
        .get(idempotency_key)
        .and_then(|id| inner.tasks.get(id))
        .cloned(),
    )
  }

  async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
    let mut inner = self.inner.lock().await;
    let reaped = inner
      .tasks
      .values_mut()
      .filter(|t| t.is_exhausted(now))
      .map(|task| {
        task.status = TaskStatus::Failed;
        task.error = Some(LEASE_EXPIRED.to_string());
        task.retryable = false;
        task.updated_at = now;
        task.clone()
      })
      .collect();
    Ok(reaped)
  }

  async fn cancel_pending(&self, instance_id: &str) -> Result<u64, QueueError> {
    let mut inner = self.inner.lock().await;
    let now = Utc::now();
    let mut count = 0;
    for task in inner
      .tasks
      .values_mut()
      .filter(|t| t.instance_id == instance_id && t.is_pending())
    {
      task.status = TaskStatus::Cancelled;
      task.updated_at = now;
      count += 1;
    }
    Ok(count)
  }
}
