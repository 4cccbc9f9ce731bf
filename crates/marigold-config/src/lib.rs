//! Marigold Config
//!
//! This crate contains the serializable configuration types for marigold:
//! workflow definition documents as they are authored, and the tuning knobs
//! of the engine itself.
//!
//! Definition documents are loaded from:
//! - JSON files (via the CLI `definitions/` directory)
//! - Code (tests and embedders build [`WorkflowDef`] values directly)
//!
//! The workflow crate validates these documents and turns them into the
//! immutable definitions the engine executes.

mod engine;
mod input;
mod retry;
mod step;
mod workflow;

pub use engine::{ConfigError, EngineConfig};
pub use input::InputValue;
pub use retry::RetryPolicy;
pub use step::{StepDef, StepKind};
pub use workflow::WorkflowDef;
