use serde::{Deserialize, Serialize};

use crate::step::StepDef;

/// A workflow definition document: a named, versioned, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub name: String,
  pub version: u32,
  pub steps: Vec<StepDef>,
}

impl WorkflowDef {
  /// Parse a definition document from JSON text.
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}
