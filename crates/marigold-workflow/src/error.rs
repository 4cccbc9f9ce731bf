use thiserror::Error;

/// Errors raised while validating, registering or looking up definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("workflow name must not be empty")]
  EmptyName,

  #[error("workflow '{name}' has invalid version 0 (versions start at 1)")]
  InvalidVersion { name: String },

  #[error("workflow '{name}' has no steps")]
  NoSteps { name: String },

  #[error("step {index} has an empty step id")]
  EmptyStepId { index: usize },

  #[error("duplicate step id: {step_id}")]
  DuplicateStepId { step_id: String },

  #[error("step '{step_id}': {message}")]
  InvalidStep { step_id: String, message: String },

  #[error("step '{step_id}' input '{input}' has an invalid template: {message}")]
  InvalidTemplate {
    step_id: String,
    input: String,
    message: String,
  },

  #[error("step '{step_id}' input '{input}' references undefined upstream step '{reference}'")]
  UndefinedReference {
    step_id: String,
    input: String,
    reference: String,
  },

  #[error("workflow {name}@{version} is already registered")]
  AlreadyRegistered { name: String, version: u32 },

  #[error("workflow {name}@{version} not found")]
  NotFound { name: String, version: u32 },

  #[error("failed to load definition '{path}': {message}")]
  Load { path: String, message: String },
}
