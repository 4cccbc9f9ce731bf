use std::collections::HashSet;

use marigold_config::{StepDef, StepKind, WorkflowDef};
use minijinja::Environment;

use crate::error::WorkflowError;
use crate::workflow::{ActivityStep, SignalStep, Step, Workflow};

/// Template roots an input mapping may read from.
const INPUT_ROOT: &str = "input";
const STEPS_ROOT: &str = "steps";

/// Validate a definition document and convert it into a [`Workflow`].
///
/// Checks that:
/// - the name is non-empty and the version starts at 1
/// - there is at least one step and step ids are unique
/// - activity and signal names are present
/// - every input template parses and only reads `input` or the output of
///   a step that runs earlier in the list
pub fn validate(def: &WorkflowDef) -> Result<Workflow, WorkflowError> {
  if def.name.trim().is_empty() {
    return Err(WorkflowError::EmptyName);
  }
  if def.version == 0 {
    return Err(WorkflowError::InvalidVersion {
      name: def.name.clone(),
    });
  }
  if def.steps.is_empty() {
    return Err(WorkflowError::NoSteps {
      name: def.name.clone(),
    });
  }

  let env = Environment::new();
  let mut earlier: HashSet<&str> = HashSet::new();
  let mut steps = Vec::with_capacity(def.steps.len());

  for (index, step_def) in def.steps.iter().enumerate() {
    if step_def.step_id.trim().is_empty() {
      return Err(WorkflowError::EmptyStepId { index });
    }
    if earlier.contains(step_def.step_id.as_str()) {
      return Err(WorkflowError::DuplicateStepId {
        step_id: step_def.step_id.clone(),
      });
    }

    steps.push(validate_step(&env, step_def, &earlier)?);
    earlier.insert(step_def.step_id.as_str());
  }

  Ok(Workflow {
    name: def.name.clone(),
    version: def.version,
    steps,
  })
}

fn validate_step(
  env: &Environment<'_>,
  step_def: &StepDef,
  earlier: &HashSet<&str>,
) -> Result<Step, WorkflowError> {
  let step_id = &step_def.step_id;
  let invalid = |message: &str| WorkflowError::InvalidStep {
    step_id: step_id.clone(),
    message: message.to_string(),
  };

  match &step_def.kind {
    StepKind::Activity {
      activity_name,
      inputs,
      queue,
      max_attempts,
    } => {
      if activity_name.trim().is_empty() {
        return Err(invalid("activity_name must not be empty"));
      }
      if queue.as_deref().is_some_and(|q| q.trim().is_empty()) {
        return Err(invalid("queue must not be empty when given"));
      }
      if *max_attempts == Some(0) {
        return Err(invalid("max_attempts must be at least 1"));
      }
      for (input, template) in inputs {
        check_template(env, step_id, input, template, earlier)?;
      }

      Ok(Step::Activity(ActivityStep {
        step_id: step_id.clone(),
        activity_name: activity_name.clone(),
        inputs: inputs.clone(),
        queue: queue.clone(),
        max_attempts: *max_attempts,
      }))
    }
    StepKind::WaitForSignal {
      signal_name,
      deadline_ms,
      approval_field,
    } => {
      if signal_name.trim().is_empty() {
        return Err(invalid("signal_name must not be empty"));
      }
      if *deadline_ms == Some(0) {
        return Err(invalid("deadline_ms must be greater than zero"));
      }
      if approval_field.as_deref().is_some_and(|f| f.trim().is_empty()) {
        return Err(invalid("approval_field must not be empty when given"));
      }

      Ok(Step::WaitForSignal(SignalStep {
        step_id: step_id.clone(),
        signal_name: signal_name.clone(),
        deadline_ms: *deadline_ms,
        approval_field: approval_field.clone(),
      }))
    }
  }
}

/// Parse a single input template and check the variables it reads.
fn check_template(
  env: &Environment<'_>,
  step_id: &str,
  input: &str,
  template: &str,
  earlier: &HashSet<&str>,
) -> Result<(), WorkflowError> {
  let parsed = env
    .template_from_str(template)
    .map_err(|e| WorkflowError::InvalidTemplate {
      step_id: step_id.to_string(),
      input: input.to_string(),
      message: e.to_string(),
    })?;

  for variable in parsed.undeclared_variables(true) {
    let mut parts = variable.split('.');
    match parts.next() {
      Some(INPUT_ROOT) => {}
      Some(STEPS_ROOT) => {
        // Dynamic lookups such as `steps[name]` only expose the root.
        if let Some(reference) = parts.next() {
          if !earlier.contains(reference) {
            return Err(WorkflowError::UndefinedReference {
              step_id: step_id.to_string(),
              input: input.to_string(),
              reference: reference.to_string(),
            });
          }
        }
      }
      _ => {
        return Err(WorkflowError::InvalidTemplate {
          step_id: step_id.to_string(),
          input: input.to_string(),
          message: format!(
            "unknown variable '{}' (expected '{}' or '{}')",
            variable, INPUT_ROOT, STEPS_ROOT
          ),
        });
      }
    }
  }

  Ok(())
}
