//! Activity input resolution using minijinja templates.
//!
//! Each entry of an activity step's `inputs` is a template rendered against
//! the instance's data:
//!
//! ```json
//! {
//!   "input": { "firstname": "Ada", "lastname": "Lovelace" },
//!   "steps": { "approval": { "approved": true } }
//! }
//! ```
//!
//! where `steps` holds the output of every completed activity step and the
//! payload of every received signal, keyed by step id.
//!
//! # Typing
//! A template that is exactly one `{{ ... }}` expression yields the value
//! the expression evaluates to, with its type intact: `"{{ input.count }}"`
//! passes a number and `"{{ steps.lookup }}"` passes an object, while a
//! string such as `"42"` stays the string `"42"`. A path that resolves to
//! nothing yields `null`. Every other template, including plain text and
//! text mixed with expressions, is rendered and passed as a string.
//!
//! # Pass-through
//! A step with no inputs receives the workflow input unchanged.

use std::collections::HashMap;
use std::fmt::Display;

use minijinja::{Environment, Value};
use serde_json::json;

use crate::error::EngineError;

/// Resolve an activity step's inputs into the task input.
///
/// # Arguments
/// * `step_id` - The step being resolved (for error messages)
/// * `inputs` - The step's input templates
/// * `workflow_input` - The instance input
/// * `step_outputs` - Outputs of earlier steps, keyed by step id
pub fn resolve_inputs(
  step_id: &str,
  inputs: &HashMap<String, String>,
  workflow_input: &serde_json::Value,
  step_outputs: &HashMap<String, serde_json::Value>,
) -> Result<serde_json::Value, EngineError> {
  if inputs.is_empty() {
    return Ok(workflow_input.clone());
  }

  let env = Environment::new();
  let context = Value::from_serialize(json!({
    "input": workflow_input,
    "steps": step_outputs,
  }));

  let mut resolved = serde_json::Map::new();
  for (key, template) in inputs {
    let value = resolve_template(&env, template, &context)
      .map_err(|message| input_error(step_id, key, message))?;
    resolved.insert(key.clone(), value);
  }

  Ok(serde_json::Value::Object(resolved))
}

/// Evaluate a single-expression template, or render any other template.
fn resolve_template(
  env: &Environment,
  template: &str,
  context: &Value,
) -> Result<serde_json::Value, String> {
  match single_expression(template) {
    Some(expr) => {
      let value = env
        .compile_expression(expr)
        .and_then(|expression| expression.eval(context))
        .map_err(|e| e.to_string())?;
      serde_json::to_value(&value).map_err(|e| e.to_string())
    }
    None => env
      .render_str(template, context)
      .map(serde_json::Value::String)
      .map_err(|e| e.to_string()),
  }
}

/// The expression inside a template made of one `{{ ... }}` block and
/// nothing else.
fn single_expression(template: &str) -> Option<&str> {
  let inner = template.strip_prefix("{{")?.strip_suffix("}}")?;
  let inner = inner.strip_prefix('-').unwrap_or(inner);
  let inner = inner.strip_suffix('-').unwrap_or(inner);

  let nested = ["{{", "}}", "{%", "%}", "{#", "#}"]
    .iter()
    .any(|delimiter| inner.contains(delimiter));
  (!nested && !inner.trim().is_empty()).then_some(inner)
}

fn input_error(step_id: &str, input: &str, message: impl Display) -> EngineError {
  EngineError::Input {
    step_id: step_id.to_string(),
    input: input.to_string(),
    message: message.to_string(),
  }
}
