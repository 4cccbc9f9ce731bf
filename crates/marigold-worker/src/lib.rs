//! Marigold Worker
//!
//! Executes activity tasks. A [`WorkerPool`] leases tasks through a
//! [`WorkerClient`], looks the activity up by name in an
//! [`ActivityRegistry`], runs it while heartbeating the lease and reports
//! the result back.
//!
//! The pool never talks to storage directly: the client decides what a
//! completion means (for the engine, advancing the owning instance).

mod activity;
mod client;
mod pool;
mod registry;

pub use activity::{Activity, ActivityContext, ActivityError};
pub use client::{WorkerClient, WorkerError};
pub use pool::{WorkerConfig, WorkerPool};
pub use registry::ActivityRegistry;
