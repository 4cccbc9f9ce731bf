use marigold_queue::QueueError;
use marigold_store::{InstanceStatus, StoreError};
use marigold_workflow::WorkflowError;

/// Errors raised by the executor and the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// A definition or request failed validation.
  #[error("validation failed: {0}")]
  Validation(#[from] WorkflowError),

  #[error("workflow definition {name}@{version} is not registered")]
  DefinitionNotFound { name: String, version: u32 },

  #[error("instance not found: {0}")]
  NotFound(String),

  /// Optimistic concurrency kept failing after every allowed retry.
  #[error("instance {instance_id} still conflicting after {attempts} attempts")]
  Conflict { instance_id: String, attempts: u32 },

  /// The request needs a non-terminal instance.
  #[error("instance {instance_id} is already {status}")]
  Terminal {
    instance_id: String,
    status: InstanceStatus,
  },

  #[error("step '{step_id}' input '{input}' failed to resolve: {message}")]
  Input {
    step_id: String,
    input: String,
    message: String,
  },

  #[error("store error: {0}")]
  Store(#[source] StoreError),

  #[error("queue error: {0}")]
  Queue(#[from] QueueError),
}

impl EngineError {
  /// Whether the error is a lost optimistic-concurrency race that a reload
  /// and retry may resolve.
  pub fn is_conflict(&self) -> bool {
    matches!(self, EngineError::Store(e) if e.is_conflict())
  }
}

impl From<StoreError> for EngineError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::NotFound(id) => EngineError::NotFound(id),
      other => EngineError::Store(other),
    }
  }
}

/// Errors returned to the sender of a signal.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
  #[error("instance not found: {0}")]
  NotFound(String),

  /// The instance is not waiting for this signal. Nothing was written.
  #[error("signal '{signal_name}' rejected by instance {instance_id}: {reason}")]
  InvalidSignal {
    instance_id: String,
    signal_name: String,
    reason: String,
  },

  /// Another writer changed the instance first, typically a concurrent
  /// delivery of the same signal. Nothing was written.
  #[error("signal '{signal_name}' lost a concurrent update on instance {instance_id}")]
  Conflict {
    instance_id: String,
    signal_name: String,
  },

  #[error(transparent)]
  Engine(#[from] EngineError),
}
