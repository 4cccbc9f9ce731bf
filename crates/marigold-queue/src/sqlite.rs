use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::types::{NewTask, Task, TaskStatus};
use crate::{LEASE_EXPIRED, QueueError, TaskQueue, lease_until};

const TASK_COLUMNS: &str = "task_id, queue, instance_id, step_index, activity_name, input, \
  attempt, idempotency_key, visible_at, deliveries, max_deliveries, status, output, error, \
  retryable, created_at, updated_at";

/// SQLite-based task queue.
///
/// `visible_at` is stored as unix milliseconds so ready-task scans and
/// lease compare-and-set updates are plain integer comparisons.
pub struct SqliteQueue {
  pool: SqlitePool,
}

impl SqliteQueue {
  /// Create a new SQLite queue with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  async fn fetch_where(&self, clause: &str, value: &str) -> Result<Option<Task>, QueueError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
      "SELECT {} FROM tasks WHERE {} = ?",
      TASK_COLUMNS, clause
    ))
    .bind(value)
    .fetch_optional(&self.pool)
    .await?;

    row.map(Task::try_from).transpose()
  }

  /// Retire a pending task. Fails with `Retired` if it already has an
  /// outcome.
  async fn retire(
    &self,
    task_id: &str,
    status: TaskStatus,
    output: Option<Value>,
    error: Option<&str>,
    retryable: bool,
  ) -> Result<Task, QueueError> {
    let updated = sqlx::query(
      r#"
      UPDATE tasks
      SET status = ?, output = ?, error = ?, retryable = ?, updated_at = ?
      WHERE task_id = ? AND status = 'pending'
      "#,
    )
    .bind(status)
    .bind(output.map(Json))
    .bind(error)
    .bind(retryable)
    .bind(Utc::now())
    .bind(task_id)
    .execute(&self.pool)
    .await?
    .rows_affected();

    let task = self.get(task_id).await?;
    if updated == 0 {
      return Err(QueueError::Retired {
        task_id: task_id.to_string(),
        status: task.status,
      });
    }
    Ok(task)
  }
}

#[derive(FromRow)]
struct TaskRow {
  task_id: String,
  queue: String,
  instance_id: String,
  step_index: i64,
  activity_name: String,
  input: Json<Value>,
  attempt: i64,
  idempotency_key: String,
  visible_at: i64,
  deliveries: i64,
  max_deliveries: i64,
  status: TaskStatus,
  output: Option<Json<Value>>,
  error: Option<String>,
  retryable: bool,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
  type Error = QueueError;

  fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
    let visible_at = DateTime::from_timestamp_millis(row.visible_at).ok_or_else(|| {
      QueueError::Corrupt(format!(
        "task {} has invalid visible_at {}",
        row.task_id, row.visible_at
      ))
    })?;

    Ok(Task {
      task_id: row.task_id,
      queue: row.queue,
      instance_id: row.instance_id,
      step_index: row.step_index as u32,
      activity_name: row.activity_name,
      input: row.input.0,
      attempt: row.attempt as u32,
      idempotency_key: row.idempotency_key,
      visible_at,
      deliveries: row.deliveries as u32,
      max_deliveries: row.max_deliveries as u32,
      status: row.status,
      output: row.output.map(|o| o.0),
      error: row.error,
      retryable: row.retryable,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[async_trait]
impl TaskQueue for SqliteQueue {
  async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError> {
    let task = task.into_task(Uuid::new_v4().to_string(), Utc::now());

    let inserted = sqlx::query(
      r#"
      INSERT INTO tasks (
        task_id, queue, instance_id, step_index, activity_name, input, attempt,
        idempotency_key, visible_at, deliveries, max_deliveries, status, retryable,
        created_at, updated_at
      )
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 1, ?, ?)
      ON CONFLICT (idempotency_key) DO NOTHING
      "#,
    )
    .bind(&task.task_id)
    .bind(&task.queue)
    .bind(&task.instance_id)
    .bind(task.step_index as i64)
    .bind(&task.activity_name)
    .bind(Json(&task.input))
    .bind(task.attempt as i64)
    .bind(&task.idempotency_key)
    .bind(task.visible_at.timestamp_millis())
    .bind(task.max_deliveries as i64)
    .bind(task.status)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&self.pool)
    .await?
    .rows_affected();

    if inserted == 0 {
      debug!(idempotency_key = %task.idempotency_key, "task_enqueue_deduplicated");
    }

    self
      .fetch_where("idempotency_key", &task.idempotency_key)
      .await?
      .ok_or_else(|| QueueError::NotFound(task.idempotency_key.clone()))
  }

  async fn poll(
    &self,
    queue: &str,
    max_tasks: usize,
    lease: Duration,
  ) -> Result<Vec<Task>, QueueError> {
    let now = Utc::now();
    let now_ms = now.timestamp_millis();
    let until_ms = lease_until(now, lease).timestamp_millis();

    let candidates: Vec<(String, i64)> = sqlx::query_as(
      r#"
      SELECT task_id, visible_at
      FROM tasks
      WHERE queue = ? AND status = 'pending' AND visible_at <= ? AND deliveries < max_deliveries
      ORDER BY visible_at ASC, created_at ASC
      LIMIT ?
      "#,
    )
    .bind(queue)
    .bind(now_ms)
    .bind(max_tasks as i64)
    .fetch_all(&self.pool)
    .await?;

    let mut leased = Vec::with_capacity(candidates.len());
    for (task_id, seen_visible_at) in candidates {
      // Compare-and-set on visible_at: if another poller leased the task
      // since we read it, the row no longer matches and we skip it.
      let won = sqlx::query(
        r#"
        UPDATE tasks
        SET visible_at = ?, deliveries = deliveries + 1, updated_at = ?
        WHERE task_id = ? AND visible_at = ? AND status = 'pending'
        "#,
      )
      .bind(until_ms)
      .bind(now)
      .bind(&task_id)
      .bind(seen_visible_at)
      .execute(&self.pool)
      .await?
      .rows_affected()
        == 1;

      if won {
        leased.push(self.get(&task_id).await?);
      }
    }

    Ok(leased)
  }

  async fn heartbeat(&self, task_id: &str, lease: Duration) -> Result<Task, QueueError> {
    let now = Utc::now();
    let updated = sqlx::query(
      r#"
      UPDATE tasks
      SET visible_at = ?, updated_at = ?
      WHERE task_id = ? AND status = 'pending'
      "#,
    )
    .bind(lease_until(now, lease).timestamp_millis())
    .bind(now)
    .bind(task_id)
    .execute(&self.pool)
    .await?
    .rows_affected();

    let task = self.get(task_id).await?;
    if updated == 0 {
      return Err(QueueError::Retired {
        task_id: task_id.to_string(),
        status: task.status,
      });
    }
    Ok(task)
  }

  async fn complete(&self, task_id: &str, output: Value) -> Result<Task, QueueError> {
    self
      .retire(task_id, TaskStatus::Completed, Some(output), None, true)
      .await
  }

  async fn fail(&self, task_id: &str, error: &str, retryable: bool) -> Result<Task, QueueError> {
    self
      .retire(task_id, TaskStatus::Failed, None, Some(error), retryable)
      .await
  }

  async fn get(&self, task_id: &str) -> Result<Task, QueueError> {
    self
      .fetch_where("task_id", task_id)
      .await?
      .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
  }

  async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Task>, QueueError> {
    self.fetch_where("idempotency_key", idempotency_key).await
  }

  async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
    let expired: Vec<(String,)> = sqlx::query_as(
      r#"
      SELECT task_id
      FROM tasks
      WHERE status = 'pending' AND visible_at <= ? AND deliveries >= max_deliveries
      "#,
    )
    .bind(now.timestamp_millis())
    .fetch_all(&self.pool)
    .await?;

    let mut reaped = Vec::with_capacity(expired.len());
    for (task_id,) in expired {
      match self
        .retire(&task_id, TaskStatus::Failed, None, Some(LEASE_EXPIRED), false)
        .await
      {
        Ok(task) => reaped.push(task),
        // Reported or reaped by someone else in the meantime.
        Err(QueueError::Retired { .. }) => {}
        Err(e) => return Err(e),
      }
    }

    Ok(reaped)
  }

  async fn cancel_pending(&self, instance_id: &str) -> Result<u64, QueueError> {
    let result = sqlx::query(
      r#"
      UPDATE tasks
      SET status = 'cancelled', updated_at = ?
      WHERE instance_id = ? AND status = 'pending'
      "#,
    )
    .bind(Utc::now())
    .bind(instance_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }
}
