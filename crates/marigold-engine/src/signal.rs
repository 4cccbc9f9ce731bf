//! Signal delivery.
//!
//! A signal is accepted only by an instance that is waiting for exactly that
//! signal and whose deadline has not passed. Acceptance is a single
//! version-checked append, so when two deliveries of the same signal race,
//! exactly one commits and the other sees a conflict.

use std::sync::Arc;

use chrono::Utc;
use marigold_store::{EventKind, Failure, FailureKind, InstanceStatus, WorkflowInstance};
use marigold_workflow::Step;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, SignalError};
use crate::events::EngineEvent;
use crate::executor::Executor;

pub struct SignalRouter {
  executor: Arc<Executor>,
}

impl SignalRouter {
  pub fn new(executor: Arc<Executor>) -> Self {
    Self { executor }
  }

  /// Deliver a signal to a waiting instance.
  ///
  /// A rejected signal leaves the instance untouched. An accepted signal
  /// whose payload does not approve fails the instance. Otherwise the
  /// payload becomes the signal step's output and the instance resumes.
  #[instrument(
    name = "signal_receive",
    skip(self, payload),
    fields(instance_id = %instance_id, signal = %signal_name)
  )]
  pub async fn receive_signal(
    &self,
    instance_id: &str,
    signal_name: &str,
    payload: Value,
  ) -> Result<WorkflowInstance, SignalError> {
    let store = self.executor.store();
    let instance = match store.load(instance_id).await {
      Ok(instance) => instance,
      Err(e) => {
        return Err(match EngineError::from(e) {
          EngineError::NotFound(id) => SignalError::NotFound(id),
          other => other.into(),
        });
      }
    };

    let reject = |reason: String| {
      warn!(reason = %reason, "signal_rejected");
      SignalError::InvalidSignal {
        instance_id: instance_id.to_string(),
        signal_name: signal_name.to_string(),
        reason,
      }
    };

    if instance.status != InstanceStatus::WaitingSignal {
      return Err(reject(format!("instance is {}", instance.status)));
    }
    if instance.awaited_signal.as_deref() != Some(signal_name) {
      return Err(reject(format!(
        "instance is waiting for '{}'",
        instance.awaited_signal.as_deref().unwrap_or_default()
      )));
    }
    if let Some(deadline_at) = instance.deadline_at
      && deadline_at <= Utc::now()
    {
      return Err(reject(format!("deadline passed at {}", deadline_at)));
    }

    let workflow = self
      .executor
      .definitions()
      .lookup(&instance.definition_name, instance.definition_version)
      .map_err(EngineError::from)?;
    let index = instance.current_step_index;
    let Some(Step::WaitForSignal(wait)) = workflow.step(index as usize) else {
      return Err(reject(format!("step {} does not wait for a signal", index)));
    };

    let received = EventKind::SignalReceived {
      step_index: index,
      signal_name: signal_name.to_string(),
      payload: payload.clone(),
    };

    if !wait.approves(&payload) {
      let failure = Failure::new(FailureKind::NotApproved, "not approved", Some(index));
      let instance = self
        .executor
        .fail_instance(instance, vec![received], failure)
        .await
        .map_err(|e| self.conflict(e, instance_id, signal_name))?;
      info!(approved = false, "signal_accepted");
      self.accepted(instance_id, signal_name);
      return Ok(instance);
    }

    let mut state = instance
      .state()
      .clear_wait()
      .with_status(InstanceStatus::Running);
    state.current_step_index = index + 1;

    let resumed = store
      .append_events(instance_id, instance.version, vec![received], state)
      .await
      .map_err(|e| self.conflict(e.into(), instance_id, signal_name))?;
    info!(approved = true, "signal_accepted");
    self.accepted(instance_id, signal_name);

    // The signal is durable. If advancing fails here, recovery picks the
    // instance up later.
    match self.executor.advance(instance_id).await {
      Ok(instance) => Ok(instance),
      Err(e) => {
        warn!(error = %e, "signal_resume_failed");
        Ok(resumed)
      }
    }
  }

  fn conflict(&self, e: EngineError, instance_id: &str, signal_name: &str) -> SignalError {
    if e.is_conflict() {
      warn!("signal_conflict");
      SignalError::Conflict {
        instance_id: instance_id.to_string(),
        signal_name: signal_name.to_string(),
      }
    } else {
      e.into()
    }
  }

  fn accepted(&self, instance_id: &str, signal_name: &str) {
    self.executor.notify(EngineEvent::SignalAccepted {
      instance_id: instance_id.to_string(),
      signal_name: signal_name.to_string(),
    });
  }
}
