use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A validated workflow definition ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub name: String,
  pub version: u32,
  pub steps: Vec<Step>,
}

impl Workflow {
  /// Get the step at `index`, or `None` past the last step.
  pub fn step(&self, index: usize) -> Option<&Step> {
    self.steps.get(index)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
  Activity(ActivityStep),
  WaitForSignal(SignalStep),
}

impl Step {
  pub fn step_id(&self) -> &str {
    match self {
      Step::Activity(step) => &step.step_id,
      Step::WaitForSignal(step) => &step.step_id,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStep {
  pub step_id: String,
  pub activity_name: String,
  pub inputs: HashMap<String, String>,
  pub queue: Option<String>,
  pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalStep {
  pub step_id: String,
  pub signal_name: String,
  pub deadline_ms: Option<u64>,
  pub approval_field: Option<String>,
}

impl SignalStep {
  pub fn deadline(&self) -> Option<Duration> {
    self.deadline_ms.map(Duration::from_millis)
  }

  /// Whether a signal payload passes the step's approval gate.
  ///
  /// Steps without a gate accept every payload. Gated steps require the
  /// named field to be the boolean `true`.
  pub fn approves(&self, payload: &serde_json::Value) -> bool {
    match &self.approval_field {
      None => true,
      Some(field) => payload.get(field).and_then(|v| v.as_bool()) == Some(true),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn gated() -> SignalStep {
    SignalStep {
      step_id: "approval".to_string(),
      signal_name: "onboarding-approval".to_string(),
      deadline_ms: None,
      approval_field: Some("approved".to_string()),
    }
  }

  #[test]
  fn test_gate_accepts_true() {
    assert!(gated().approves(&json!({ "approved": true })));
  }

  #[test]
  fn test_gate_rejects_false_missing_and_non_boolean() {
    let step = gated();
    assert!(!step.approves(&json!({ "approved": false })));
    assert!(!step.approves(&json!({})));
    assert!(!step.approves(&json!({ "approved": "yes" })));
    assert!(!step.approves(&json!(null)));
  }

  #[test]
  fn test_ungated_accepts_anything() {
    let step = SignalStep {
      approval_field: None,
      ..gated()
    };
    assert!(step.approves(&json!(null)));
    assert!(step.approves(&json!({ "approved": false })));
  }
}
