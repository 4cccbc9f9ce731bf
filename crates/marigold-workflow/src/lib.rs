//! Marigold Workflow
//!
//! This crate provides the validated, immutable representation of a workflow
//! definition and the registry that holds them.
//!
//! Key differences from `marigold-config`:
//! - Step ids are unique and every template reference points at an earlier step
//! - Templates are known to parse
//! - Definitions are keyed by `(name, version)` and never change once registered
//!
//! A [`DefinitionRegistry`] is populated once at startup and then shared
//! read-only (behind an `Arc`) with the executor and the worker side.

mod error;
mod registry;
mod validate;
mod workflow;

pub use error::WorkflowError;
pub use registry::DefinitionRegistry;
pub use validate::validate;
pub use workflow::{ActivityStep, SignalStep, Step, Workflow};
