use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use crate::types::{
  CreateOutcome, Event, EventKind, Failure, InstanceState, InstanceStatus, NewInstance,
  WorkflowInstance,
};
use crate::{InstanceStore, StoreError, check_append};

/// Open a SQLite connection pool, creating the database file if needed.
///
/// `sqlite::memory:` is limited to one connection so every query sees the
/// same in-memory database.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
  let options = SqliteConnectOptions::from_str(url)?
    .create_if_missing(true)
    .foreign_keys(true);
  let max_connections = if url.contains(":memory:") { 1 } else { 8 };

  SqlitePoolOptions::new()
    .max_connections(max_connections)
    .connect_with(options)
    .await
}

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  async fn fetch(&self, instance_id: &str) -> Result<Option<WorkflowInstance>, StoreError> {
    let row: Option<InstanceRow> = sqlx::query_as(&format!(
      "SELECT {} FROM workflow_instances WHERE instance_id = ?",
      INSTANCE_COLUMNS
    ))
    .bind(instance_id)
    .fetch_optional(&self.pool)
    .await?;

    row.map(WorkflowInstance::try_from).transpose()
  }
}

const INSTANCE_COLUMNS: &str = "instance_id, definition_name, definition_version, status, \
  current_step_index, input, output, error, awaited_signal, deadline_at, idempotency_key, \
  version, created_at, updated_at";

#[derive(FromRow)]
struct InstanceRow {
  instance_id: String,
  definition_name: String,
  definition_version: i64,
  status: InstanceStatus,
  current_step_index: i64,
  input: Json<Value>,
  output: Option<Json<Value>>,
  error: Option<Json<Failure>>,
  awaited_signal: Option<String>,
  deadline_at: Option<i64>,
  idempotency_key: Option<String>,
  version: i64,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for WorkflowInstance {
  type Error = StoreError;

  fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
    let deadline_at = match row.deadline_at {
      Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        StoreError::Corrupt(format!(
          "instance {} has invalid deadline {}",
          row.instance_id, ms
        ))
      })?),
      None => None,
    };

    Ok(WorkflowInstance {
      instance_id: row.instance_id,
      definition_name: row.definition_name,
      definition_version: row.definition_version as u32,
      status: row.status,
      current_step_index: row.current_step_index as u32,
      input: row.input.0,
      output: row.output.map(|o| o.0),
      error: row.error.map(|e| e.0),
      awaited_signal: row.awaited_signal,
      deadline_at,
      idempotency_key: row.idempotency_key,
      version: row.version as u64,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(FromRow)]
struct EventRow {
  instance_id: String,
  sequence: i64,
  kind: Json<EventKind>,
  recorded_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
  fn from(row: EventRow) -> Self {
    Event {
      instance_id: row.instance_id,
      sequence: row.sequence as u64,
      kind: row.kind.0,
      recorded_at: row.recorded_at,
    }
  }
}

#[async_trait]
impl InstanceStore for SqliteStore {
  async fn create(&self, new: NewInstance) -> Result<CreateOutcome, StoreError> {
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    // The UNIQUE index on idempotency_key makes a racing duplicate insert
    // a no-op; whoever lost reads back the winner's row.
    let inserted = sqlx::query(
      r#"
      INSERT INTO workflow_instances (
        instance_id, definition_name, definition_version, status, current_step_index,
        input, idempotency_key, version, created_at, updated_at
      )
      VALUES (?, ?, ?, ?, 0, ?, ?, 1, ?, ?)
      ON CONFLICT (idempotency_key) DO NOTHING
      "#,
    )
    .bind(&new.instance_id)
    .bind(&new.definition_name)
    .bind(new.definition_version as i64)
    .bind(InstanceStatus::Created)
    .bind(Json(&new.input))
    .bind(&new.idempotency_key)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
      tx.rollback().await?;
      let key = new.idempotency_key.unwrap_or_default();
      let row: InstanceRow = sqlx::query_as(&format!(
        "SELECT {} FROM workflow_instances WHERE idempotency_key = ?",
        INSTANCE_COLUMNS
      ))
      .bind(&key)
      .fetch_one(&self.pool)
      .await?;
      return Ok(CreateOutcome::Existing(row.try_into()?));
    }

    let kind = EventKind::InstanceCreated {
      definition_name: new.definition_name.clone(),
      definition_version: new.definition_version,
      input: new.input.clone(),
    };
    insert_event(&mut tx, &new.instance_id, 1, &kind, now).await?;
    tx.commit().await?;

    Ok(CreateOutcome::Created(WorkflowInstance {
      instance_id: new.instance_id,
      definition_name: new.definition_name,
      definition_version: new.definition_version,
      status: InstanceStatus::Created,
      current_step_index: 0,
      input: new.input,
      output: None,
      error: None,
      awaited_signal: None,
      deadline_at: None,
      idempotency_key: new.idempotency_key,
      version: 1,
      created_at: now,
      updated_at: now,
    }))
  }

  async fn load(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError> {
    self
      .fetch(instance_id)
      .await?
      .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))
  }

  async fn append_events(
    &self,
    instance_id: &str,
    expected_version: u64,
    events: Vec<EventKind>,
    state: InstanceState,
  ) -> Result<WorkflowInstance, StoreError> {
    let mut instance = self.load(instance_id).await?;
    check_append(&instance, expected_version, &state)?;

    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    // The version guard is what makes this safe across processes: the
    // check above is only a fast path.
    let updated = sqlx::query(
      r#"
      UPDATE workflow_instances
      SET status = ?, current_step_index = ?, output = ?, error = ?,
          awaited_signal = ?, deadline_at = ?, version = version + 1, updated_at = ?
      WHERE instance_id = ? AND version = ?
      "#,
    )
    .bind(state.status)
    .bind(state.current_step_index as i64)
    .bind(state.output.as_ref().map(Json))
    .bind(state.error.as_ref().map(Json))
    .bind(&state.awaited_signal)
    .bind(state.deadline_at.map(|d| d.timestamp_millis()))
    .bind(now)
    .bind(instance_id)
    .bind(expected_version as i64)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != 1 {
      tx.rollback().await?;
      let actual = self.load(instance_id).await?.version;
      return Err(StoreError::Conflict {
        instance_id: instance_id.to_string(),
        expected: expected_version,
        actual,
      });
    }

    let last: i64 =
      sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM workflow_events WHERE instance_id = ?")
        .bind(instance_id)
        .fetch_one(&mut *tx)
        .await?;

    for (offset, kind) in events.iter().enumerate() {
      insert_event(&mut tx, instance_id, last + 1 + offset as i64, kind, now).await?;
    }
    tx.commit().await?;

    instance.apply(state, now);
    Ok(instance)
  }

  async fn history(&self, instance_id: &str) -> Result<Vec<Event>, StoreError> {
    // Distinguish "no such instance" from an empty history.
    self.load(instance_id).await?;

    let rows: Vec<EventRow> = sqlx::query_as(
      r#"
      SELECT instance_id, sequence, kind, recorded_at
      FROM workflow_events
      WHERE instance_id = ?
      ORDER BY sequence ASC
      "#,
    )
    .bind(instance_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(Event::from).collect())
  }

  async fn list_active(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
    let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
      "SELECT {} FROM workflow_instances \
       WHERE status IN ('created', 'running', 'waiting_signal') \
       ORDER BY created_at ASC",
      INSTANCE_COLUMNS
    ))
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(WorkflowInstance::try_from).collect()
  }

  async fn list_expired_waits(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<WorkflowInstance>, StoreError> {
    let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
      "SELECT {} FROM workflow_instances \
       WHERE status = 'waiting_signal' AND deadline_at IS NOT NULL AND deadline_at <= ? \
       ORDER BY deadline_at ASC",
      INSTANCE_COLUMNS
    ))
    .bind(now.timestamp_millis())
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(WorkflowInstance::try_from).collect()
  }
}

async fn insert_event(
  tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
  instance_id: &str,
  sequence: i64,
  kind: &EventKind,
  recorded_at: DateTime<Utc>,
) -> Result<(), StoreError> {
  sqlx::query(
    r#"
    INSERT INTO workflow_events (instance_id, sequence, event_type, kind, recorded_at)
    VALUES (?, ?, ?, ?, ?)
    "#,
  )
  .bind(instance_id)
  .bind(sequence)
  .bind(kind.name())
  .bind(Json(kind))
  .bind(recorded_at)
  .execute(&mut **tx)
  .await?;

  Ok(())
}
