use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InstanceStatus {
  Created,
  Running,
  WaitingSignal,
  Completed,
  Failed,
  Cancelled,
}

impl InstanceStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
    )
  }

  /// Whether the lifecycle state machine allows moving from `self` to `next`.
  ///
  /// ```text
  /// Created -> Running -> (WaitingSignal <-> Running) -> Completed | Failed | Cancelled
  /// ```
  ///
  /// `Running -> Running` is allowed so a step can finish and the next one
  /// start in one commit. Terminal statuses have no outgoing edges.
  pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
    use InstanceStatus::*;
    matches!(
      (self, next),
      (Created, Running)
        | (Created, Cancelled)
        | (Running, Running)
        | (Running, WaitingSignal)
        | (Running, Completed)
        | (Running, Failed)
        | (Running, Cancelled)
        | (WaitingSignal, Running)
        | (WaitingSignal, Failed)
        | (WaitingSignal, Cancelled)
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      InstanceStatus::Created => "created",
      InstanceStatus::Running => "running",
      InstanceStatus::WaitingSignal => "waiting_signal",
      InstanceStatus::Completed => "completed",
      InstanceStatus::Failed => "failed",
      InstanceStatus::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for InstanceStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// An activity exhausted its retry budget or failed non-retryably.
  Activity,
  /// A signal wait passed its deadline.
  Timeout,
  /// An approval signal arrived with the approval field not set.
  NotApproved,
  /// A task was leased as many times as its step has attempts without a
  /// reported result.
  LeaseExpired,
  /// The instance cannot make progress against its definition, e.g. the
  /// definition is no longer registered or an input template fails.
  Definition,
}

/// Structured cause of a failed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
  pub kind: FailureKind,
  pub message: String,
  /// The step that failed, if the failure belongs to a step.
  pub step_index: Option<u32>,
}

impl Failure {
  pub fn new(kind: FailureKind, message: impl Into<String>, step_index: Option<u32>) -> Self {
    Self {
      kind,
      message: message.into(),
      step_index,
    }
  }
}

impl std::fmt::Display for Failure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.step_index {
      Some(index) => write!(f, "{:?} at step {}: {}", self.kind, index, self.message),
      None => write!(f, "{:?}: {}", self.kind, self.message),
    }
  }
}

/// A workflow instance as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
  pub instance_id: String,
  pub definition_name: String,
  pub definition_version: u32,
  pub status: InstanceStatus,
  pub current_step_index: u32,
  pub input: Value,
  pub output: Option<Value>,
  pub error: Option<Failure>,
  /// Signal name the instance is suspended on, while `WaitingSignal`.
  pub awaited_signal: Option<String>,
  /// When the current signal wait times out, if it has a deadline.
  pub deadline_at: Option<DateTime<Utc>>,
  pub idempotency_key: Option<String>,
  /// Optimistic concurrency counter. Bumped by every successful append.
  pub version: u64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
  /// The mutable projection of this instance.
  pub fn state(&self) -> InstanceState {
    InstanceState {
      status: self.status,
      current_step_index: self.current_step_index,
      output: self.output.clone(),
      error: self.error.clone(),
      awaited_signal: self.awaited_signal.clone(),
      deadline_at: self.deadline_at,
    }
  }

  pub(crate) fn apply(&mut self, state: InstanceState, now: DateTime<Utc>) {
    self.status = state.status;
    self.current_step_index = state.current_step_index;
    self.output = state.output;
    self.error = state.error;
    self.awaited_signal = state.awaited_signal;
    self.deadline_at = state.deadline_at;
    self.version += 1;
    self.updated_at = now;
  }
}

/// The part of an instance that changes as it advances. Written together
/// with the events that justify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
  pub status: InstanceStatus,
  pub current_step_index: u32,
  pub output: Option<Value>,
  pub error: Option<Failure>,
  pub awaited_signal: Option<String>,
  pub deadline_at: Option<DateTime<Utc>>,
}

impl InstanceState {
  pub fn with_status(mut self, status: InstanceStatus) -> Self {
    self.status = status;
    self
  }

  /// Leave any signal wait: clears the awaited signal and its deadline.
  pub fn clear_wait(mut self) -> Self {
    self.awaited_signal = None;
    self.deadline_at = None;
    self
  }
}

/// Request to create an instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
  pub instance_id: String,
  pub definition_name: String,
  pub definition_version: u32,
  pub input: Value,
  pub idempotency_key: Option<String>,
}

/// Result of [`InstanceStore::create`](crate::InstanceStore::create).
#[derive(Debug, Clone)]
pub enum CreateOutcome {
  Created(WorkflowInstance),
  /// An instance with the same idempotency key already existed.
  Existing(WorkflowInstance),
}

impl CreateOutcome {
  pub fn instance(&self) -> &WorkflowInstance {
    match self {
      CreateOutcome::Created(instance) | CreateOutcome::Existing(instance) => instance,
    }
  }

  pub fn is_new(&self) -> bool {
    matches!(self, CreateOutcome::Created(_))
  }
}

/// An entry in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub instance_id: String,
  /// Position in the history, starting at 1 with `InstanceCreated`.
  pub sequence: u64,
  pub kind: EventKind,
  pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
  InstanceCreated {
    definition_name: String,
    definition_version: u32,
    input: Value,
  },
  Started,
  /// An activity task was enqueued for a step.
  StepStarted {
    step_index: u32,
    step_id: String,
    activity_name: String,
    attempt: u32,
    idempotency_key: String,
  },
  ActivityCompleted {
    step_index: u32,
    attempt: u32,
    idempotency_key: String,
    output: Value,
  },
  /// An attempt failed and the next one was scheduled.
  ActivityRetried {
    step_index: u32,
    attempt: u32,
    idempotency_key: String,
    error: String,
    retry_at: DateTime<Utc>,
  },
  ActivityFailed {
    step_index: u32,
    attempt: u32,
    idempotency_key: String,
    error: String,
  },
  WaitingSignal {
    step_index: u32,
    signal_name: String,
    deadline_at: Option<DateTime<Utc>>,
  },
  SignalReceived {
    step_index: u32,
    signal_name: String,
    payload: Value,
  },
  SignalTimedOut {
    step_index: u32,
    signal_name: String,
  },
  WorkflowCompleted {
    output: Value,
  },
  WorkflowFailed {
    failure: Failure,
  },
  Cancelled {
    reason: Option<String>,
  },
}

impl EventKind {
  /// Stable name of the event type, as stored alongside the payload.
  pub fn name(&self) -> &'static str {
    match self {
      EventKind::InstanceCreated { .. } => "instance_created",
      EventKind::Started => "started",
      EventKind::StepStarted { .. } => "step_started",
      EventKind::ActivityCompleted { .. } => "activity_completed",
      EventKind::ActivityRetried { .. } => "activity_retried",
      EventKind::ActivityFailed { .. } => "activity_failed",
      EventKind::WaitingSignal { .. } => "waiting_signal",
      EventKind::SignalReceived { .. } => "signal_received",
      EventKind::SignalTimedOut { .. } => "signal_timed_out",
      EventKind::WorkflowCompleted { .. } => "workflow_completed",
      EventKind::WorkflowFailed { .. } => "workflow_failed",
      EventKind::Cancelled { .. } => "cancelled",
    }
  }
}
