//! Background maintenance for an engine.
//!
//! The `EngineRunner` recovers every active instance when it starts, then
//! periodically times out expired signal waits, fails steps whose tasks
//! exhausted their leases and re-runs recovery to pick up instances whose
//! advance failed after a result was recorded.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Runs the engine's timers until cancelled.
///
/// # Usage
///
/// ```ignore
/// let runner = EngineRunner::new(engine.clone());
/// let cancel = CancellationToken::new();
/// tokio::spawn(runner.start(cancel.clone()));
/// ```
pub struct EngineRunner {
  engine: Arc<Engine>,
}

impl EngineRunner {
  pub fn new(engine: Arc<Engine>) -> Self {
    Self { engine }
  }

  /// Run until the cancellation token is triggered.
  pub async fn start(self, cancel: CancellationToken) {
    let executor = self.engine.executor();
    let config = self.engine.config();
    info!(
      sweep_interval_ms = config.sweep_interval_ms,
      recovery_interval_ms = config.recovery_interval_ms,
      "engine_runner_started"
    );

    if let Err(e) = executor.recover().await {
      warn!(error = %e, "recovery_failed");
    }

    let mut sweep = tokio::time::interval(config.sweep_interval());
    let mut recovery = tokio::time::interval(config.recovery_interval());
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Both fire immediately; recovery just ran.
    recovery.tick().await;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("engine_runner_cancelled");
          break;
        }
        _ = sweep.tick() => {
          let now = Utc::now();
          match executor.expire_waits(now).await {
            Ok(0) => {}
            Ok(count) => info!(count, "signal_waits_expired"),
            Err(e) => warn!(error = %e, "expire_waits_failed"),
          }
          match executor.reap_leases(now).await {
            Ok(0) => {}
            Ok(count) => info!(count, "task_leases_reaped"),
            Err(e) => warn!(error = %e, "reap_leases_failed"),
          }
        }
        _ = recovery.tick() => {
          match executor.recover().await {
            Ok(count) => debug!(count, "recovery_pass_finished"),
            Err(e) => warn!(error = %e, "recovery_failed"),
          }
        }
      }
    }
  }
}
