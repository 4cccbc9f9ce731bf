//! Marigold Engine
//!
//! The durable core of marigold: it drives workflow instances through their
//! steps, routes signals to suspended instances and recovers every active
//! instance from persisted state after a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  - start / signal / get / cancel                            │
//! │  - WorkerClient: poll, heartbeat, complete, fail            │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │      SignalRouter        │ ───▶ │        Executor          │
//! │  - validate and accept   │      │  - advance, recover      │
//! │    a waiting signal      │      │  - expire waits, reap    │
//! └──────────────────────────┘      └──────────────────────────┘
//!                                       │               │
//!                                       ▼               ▼
//!                              ┌───────────────┐ ┌───────────────┐
//!                              │ InstanceStore │ │   TaskQueue   │
//!                              └───────────────┘ └───────────────┘
//! ```
//!
//! The `EngineRunner` drives the timers (signal deadlines, exhausted leases,
//! periodic recovery) and a `WorkerPool` executes activities through the
//! engine's `WorkerClient` implementation.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Arc::new(Engine::new(store, queue, definitions, config));
//!
//! let id = engine
//!   .start_workflow("onboarding", 1, json!({ "firstname": "Ada" }), None)
//!   .await?;
//! engine
//!   .signal_workflow(&id, "onboarding-approval", json!({ "approved": true }))
//!   .await?;
//! ```

mod engine;
mod error;
mod events;
mod executor;
mod input;
mod runner;
mod signal;

pub use engine::{Engine, WorkflowView};
pub use error::{EngineError, SignalError};
pub use events::{ChannelNotifier, EngineEvent, EngineNotifier, NoopNotifier};
pub use executor::Executor;
pub use input::resolve_inputs;
pub use runner::EngineRunner;
pub use signal::SignalRouter;
