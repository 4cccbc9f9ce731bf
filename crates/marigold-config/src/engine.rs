use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Error loading an engine configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file '{path}': {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Tuning knobs for the executor, task queue and worker pool.
///
/// Every field has a default, so a config file only needs the values it
/// wants to change:
///
/// ```json
/// { "lease_ms": 10000, "retry": { "max_attempts": 5 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Queue that activity steps dispatch to unless they name their own.
  pub queue_name: String,
  /// How long a polled task stays invisible to other workers.
  pub lease_ms: u64,
  /// Idle delay between polls when a worker finds no ready tasks.
  pub poll_interval_ms: u64,
  pub max_tasks_per_poll: usize,
  pub worker_concurrency: usize,
  /// Interval of the background sweep for signal deadlines and lapsed leases.
  pub sweep_interval_ms: u64,
  /// Interval of the full recovery pass that re-advances every active
  /// instance, picking up work a failed invocation left behind.
  pub recovery_interval_ms: u64,
  /// How many times an optimistic-concurrency conflict is retried before
  /// the executor gives up on an invocation.
  pub max_conflict_retries: u32,
  pub retry: RetryPolicy,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      queue_name: "default".to_string(),
      lease_ms: 30_000,
      poll_interval_ms: 200,
      max_tasks_per_poll: 10,
      worker_concurrency: 4,
      sweep_interval_ms: 1_000,
      recovery_interval_ms: 30_000,
      max_conflict_retries: 8,
      retry: RetryPolicy::default(),
    }
  }
}

impl EngineConfig {
  /// Load a configuration from a JSON file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })
  }

  pub fn lease(&self) -> Duration {
    Duration::from_millis(self.lease_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  /// Never zero.
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms.max(1))
  }

  /// Never zero.
  pub fn recovery_interval(&self) -> Duration {
    Duration::from_millis(self.recovery_interval_ms.max(1))
  }
}
