use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::input::InputValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  /// Identifier of the step, unique within the definition. Later steps
  /// reference its output as `steps.<step_id>`.
  pub step_id: String,
  #[serde(flatten)]
  pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
  /// Dispatch an activity to the worker pool and wait for its result.
  Activity {
    activity_name: String,
    #[serde(default)]
    inputs: HashMap<String, InputValue>,
    /// Task queue to dispatch on. Defaults to the engine's queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
    /// Overrides the engine retry policy's attempt budget for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
  },
  /// Suspend until a named signal arrives.
  WaitForSignal {
    signal_name: String,
    /// Fail the instance with a timeout if no signal arrives in time.
    /// Absent means wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline_ms: Option<u64>,
    /// Boolean field of the signal payload that must be `true` for the
    /// workflow to continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approval_field: Option<String>,
  },
}
