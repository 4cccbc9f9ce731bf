//! Input mapping values for activity steps.
//!
//! Every mapped input is a template string that gets rendered by minijinja
//! when the step is dispatched. The render context exposes the workflow
//! input and the outputs of earlier steps:
//!
//! ```json
//! {
//!   "firstname": "{{ input.firstname }}",
//!   "approved_by": "{{ steps.approval.reviewer }}",
//!   "static_value": "42"
//! }
//! ```
//!
//! A template that is a single `{{ ... }}` expression passes the value it
//! evaluates to with its type intact. Anything else, such as `"42"` above,
//! is passed as a string.

/// An input value is a template string that gets resolved at dispatch time.
pub type InputValue = String;
