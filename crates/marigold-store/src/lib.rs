//! Marigold Store
//!
//! This crate provides durable, versioned storage for workflow instances and
//! their append-only event history.
//!
//! The [`InstanceStore`] trait defines operations for:
//! - Creating instances, idempotently under a caller-supplied key
//! - Appending events together with the state they produce, guarded by the
//!   instance version (optimistic concurrency)
//! - Reading an instance, its history and the instances that still need work
//!
//! Two implementations are provided: [`MemoryStore`] for tests and embedded
//! use, and [`SqliteStore`] for durable storage.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, connect};
pub use types::{
  CreateOutcome, Event, EventKind, Failure, FailureKind, InstanceState, InstanceStatus,
  NewInstance, WorkflowInstance,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested instance was not found.
  #[error("instance not found: {0}")]
  NotFound(String),

  /// The stored version moved on since the caller loaded the instance.
  /// Reload and retry.
  #[error("version conflict on instance {instance_id}: expected {expected}, found {actual}")]
  Conflict {
    instance_id: String,
    expected: u64,
    actual: u64,
  },

  /// The requested status change is not an edge of the lifecycle.
  #[error("invalid transition on instance {instance_id}: {from} -> {to}")]
  InvalidTransition {
    instance_id: String,
    from: InstanceStatus,
    to: InstanceStatus,
  },

  /// A stored record could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

impl StoreError {
  pub fn is_conflict(&self) -> bool {
    matches!(self, StoreError::Conflict { .. })
  }
}

/// Storage trait for workflow instances and their history.
#[async_trait]
pub trait InstanceStore: Send + Sync {
  /// Create an instance at `Created`, step 0, and record `InstanceCreated`.
  ///
  /// If `new.idempotency_key` matches an existing instance, that instance is
  /// returned and nothing is written.
  async fn create(&self, new: NewInstance) -> Result<CreateOutcome, StoreError>;

  /// Get an instance by ID.
  async fn load(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError>;

  /// Atomically append `events` and replace the instance state.
  ///
  /// Succeeds only if the stored version equals `expected_version` and the
  /// status change is allowed; the version is then bumped by one. Nothing
  /// is written on failure.
  async fn append_events(
    &self,
    instance_id: &str,
    expected_version: u64,
    events: Vec<EventKind>,
    state: InstanceState,
  ) -> Result<WorkflowInstance, StoreError>;

  /// The full event history of an instance, in sequence order.
  async fn history(&self, instance_id: &str) -> Result<Vec<Event>, StoreError>;

  /// Every instance that is not in a terminal status, oldest first.
  async fn list_active(&self) -> Result<Vec<WorkflowInstance>, StoreError>;

  /// Instances waiting on a signal whose deadline is at or before `now`.
  async fn list_expired_waits(&self, now: DateTime<Utc>)
  -> Result<Vec<WorkflowInstance>, StoreError>;
}

/// Checks shared by every store before an append is applied.
pub(crate) fn check_append(
  instance: &WorkflowInstance,
  expected_version: u64,
  state: &InstanceState,
) -> Result<(), StoreError> {
  if instance.version != expected_version {
    return Err(StoreError::Conflict {
      instance_id: instance.instance_id.clone(),
      expected: expected_version,
      actual: instance.version,
    });
  }
  if !instance.status.can_transition_to(state.status) {
    return Err(StoreError::InvalidTransition {
      instance_id: instance.instance_id.clone(),
      from: instance.status,
      to: state.status,
    });
  }
  Ok(())
}
