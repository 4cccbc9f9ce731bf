//! The scheduler/executor control loop.
//!
//! [`Executor::advance`] drives one instance forward from its current step
//! until it suspends (an activity in flight or a signal wait) or reaches a
//! terminal status. It holds no state of its own between calls: everything
//! it needs is the stored instance, its event history and the task records
//! in the queue, so any process can pick up any instance after a crash.
//!
//! Crash safety rests on two orderings:
//! - a task is enqueued (idempotently, keyed by instance, step and attempt)
//!   before the `StepStarted` event that records it, so a crash in between
//!   re-enqueues the same task, which is a no-op
//! - a step's result is read from its retired task record, so a completed
//!   activity is recorded at most once and never dispatched again

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use marigold_config::EngineConfig;
use marigold_queue::{LEASE_EXPIRED, NewTask, TaskQueue, TaskStatus};
use marigold_store::{
  Event, EventKind, Failure, FailureKind, InstanceStatus, InstanceStore, WorkflowInstance,
};
use marigold_workflow::{ActivityStep, DefinitionRegistry, SignalStep, Step, Workflow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::events::{EngineEvent, EngineNotifier};
use crate::input::resolve_inputs;

/// Where the activity at the current step stands, according to history and
/// the task queue.
enum Progress {
  NotDispatched,
  InFlight,
  /// `StepStarted` was recorded but the task record is gone.
  Lost { attempt: u32 },
  Completed {
    attempt: u32,
    idempotency_key: String,
    output: Value,
  },
  Failed {
    attempt: u32,
    idempotency_key: String,
    error: String,
    retryable: bool,
  },
}

/// A failed attempt being replaced by the next one.
struct Retry {
  attempt: u32,
  idempotency_key: String,
  error: String,
  delay: Duration,
}

pub struct Executor {
  store: Arc<dyn InstanceStore>,
  queue: Arc<dyn TaskQueue>,
  definitions: Arc<DefinitionRegistry>,
  config: EngineConfig,
  notifier: Arc<dyn EngineNotifier>,
}

impl Executor {
  pub fn new(
    store: Arc<dyn InstanceStore>,
    queue: Arc<dyn TaskQueue>,
    definitions: Arc<DefinitionRegistry>,
    config: EngineConfig,
    notifier: Arc<dyn EngineNotifier>,
  ) -> Self {
    Self {
      store,
      queue,
      definitions,
      config,
      notifier,
    }
  }

  pub fn store(&self) -> &Arc<dyn InstanceStore> {
    &self.store
  }

  pub fn queue(&self) -> &Arc<dyn TaskQueue> {
    &self.queue
  }

  pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
    &self.definitions
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub(crate) fn notify(&self, event: EngineEvent) {
    self.notifier.notify(event);
  }

  /// Drive an instance forward as far as it can go right now.
  ///
  /// Safe to call at any time and from any number of processes: a terminal
  /// or signal-waiting instance is returned unchanged, and lost
  /// optimistic-concurrency races are retried against fresh state.
  #[instrument(name = "executor_advance", skip(self), fields(instance_id = %instance_id))]
  pub async fn advance(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
    let attempts = self.config.max_conflict_retries + 1;
    for attempt in 1..=attempts {
      match self.advance_once(instance_id).await {
        Err(e) if e.is_conflict() => {
          debug!(attempt, "advance_conflict");
          self.conflict_backoff(attempt).await;
        }
        other => return other,
      }
    }

    warn!(attempts, "advance_conflict_exhausted");
    Err(EngineError::Conflict {
      instance_id: instance_id.to_string(),
      attempts,
    })
  }

  /// Jittered pause before retrying against fresh state.
  async fn conflict_backoff(&self, attempt: u32) {
    tokio::time::sleep(self.config.retry.backoff(attempt)).await;
  }

  async fn advance_once(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
    let mut instance = self.store.load(instance_id).await?;
    if instance.status.is_terminal() || instance.status == InstanceStatus::WaitingSignal {
      return Ok(instance);
    }

    if instance.status == InstanceStatus::Created {
      instance = self
        .store
        .append_events(
          instance_id,
          instance.version,
          vec![EventKind::Started],
          instance.state().with_status(InstanceStatus::Running),
        )
        .await?;
      info!(
        definition = %instance.definition_name,
        version = instance.definition_version,
        "workflow_started"
      );
      self.notify(EngineEvent::InstanceStarted {
        instance_id: instance_id.to_string(),
        definition_name: instance.definition_name.clone(),
        definition_version: instance.definition_version,
      });
    }

    let workflow = match self
      .definitions
      .lookup(&instance.definition_name, instance.definition_version)
    {
      Ok(workflow) => workflow,
      Err(e) => {
        let failure = Failure::new(FailureKind::Definition, e.to_string(), None);
        return self.fail_instance(instance, Vec::new(), failure).await;
      }
    };

    let history = self.store.history(instance_id).await?;
    let mut outputs = step_outputs(&workflow, &history);

    loop {
      if instance.status != InstanceStatus::Running {
        return Ok(instance);
      }

      let index = instance.current_step_index;
      let Some(step) = workflow.step(index as usize) else {
        return self.complete_instance(instance, &workflow, &outputs).await;
      };

      let activity = match step {
        Step::WaitForSignal(wait) => return self.suspend(instance, index, wait).await,
        Step::Activity(activity) => activity,
      };

      match self.progress(&history, index).await? {
        Progress::NotDispatched => {
          return self
            .dispatch(instance, activity, index, 1, &outputs, None)
            .await;
        }
        Progress::InFlight => return Ok(instance),
        Progress::Lost { attempt } => {
          warn!(step_index = index, attempt, "task_record_missing");
          self
            .enqueue(&instance, activity, index, attempt, &outputs, Duration::ZERO)
            .await?;
          self.retire_orphans(instance_id).await?;
          return Ok(instance);
        }
        Progress::Completed {
          attempt,
          idempotency_key,
          output,
        } => {
          let mut state = instance.state();
          state.current_step_index = index + 1;
          instance = self
            .store
            .append_events(
              instance_id,
              instance.version,
              vec![EventKind::ActivityCompleted {
                step_index: index,
                attempt,
                idempotency_key,
                output: output.clone(),
              }],
              state,
            )
            .await?;
          info!(step_index = index, attempt, "activity_completed");
          outputs.insert(activity.step_id.clone(), output);
        }
        Progress::Failed {
          attempt,
          idempotency_key,
          error,
          retryable,
        } => {
          if retryable && attempt < self.max_attempts(activity) {
            let retry = Retry {
              attempt,
              idempotency_key,
              error,
              delay: self.config.retry.backoff(attempt),
            };
            return self
              .dispatch(instance, activity, index, attempt + 1, &outputs, Some(retry))
              .await;
          }

          let kind = if error == LEASE_EXPIRED {
            FailureKind::LeaseExpired
          } else {
            FailureKind::Activity
          };
          let failed = EventKind::ActivityFailed {
            step_index: index,
            attempt,
            idempotency_key,
            error: error.clone(),
          };
          let failure = Failure::new(kind, error, Some(index));
          return self.fail_instance(instance, vec![failed], failure).await;
        }
      }
    }
  }

  /// Read the state of the current step's latest attempt.
  async fn progress(&self, history: &[Event], index: u32) -> Result<Progress, EngineError> {
    let started = history.iter().rev().find_map(|event| match &event.kind {
      EventKind::StepStarted {
        step_index,
        attempt,
        idempotency_key,
        ..
      } if *step_index == index => Some((*attempt, idempotency_key.clone())),
      _ => None,
    });

    let Some((attempt, idempotency_key)) = started else {
      return Ok(Progress::NotDispatched);
    };

    let Some(task) = self.queue.find_by_key(&idempotency_key).await? else {
      return Ok(Progress::Lost { attempt });
    };

    Ok(match task.status {
      // A cancelled task belongs to a cancelled instance, which never gets here.
      TaskStatus::Pending | TaskStatus::Cancelled => Progress::InFlight,
      TaskStatus::Completed => Progress::Completed {
        attempt,
        idempotency_key,
        output: task.output.unwrap_or(Value::Null),
      },
      TaskStatus::Failed => Progress::Failed {
        attempt,
        idempotency_key,
        error: task.error.unwrap_or_default(),
        retryable: task.retryable,
      },
    })
  }

  /// Attempts allowed for a step. Also bounds how often one task is leased.
  fn max_attempts(&self, activity: &ActivityStep) -> u32 {
    activity
      .max_attempts
      .unwrap_or(self.config.retry.max_attempts)
  }

  async fn enqueue(
    &self,
    instance: &WorkflowInstance,
    activity: &ActivityStep,
    index: u32,
    attempt: u32,
    outputs: &HashMap<String, Value>,
    delay: Duration,
  ) -> Result<marigold_queue::Task, EngineError> {
    let input = resolve_inputs(&activity.step_id, &activity.inputs, &instance.input, outputs)?;
    let task = NewTask {
      queue: activity
        .queue
        .clone()
        .unwrap_or_else(|| self.config.queue_name.clone()),
      instance_id: instance.instance_id.clone(),
      step_index: index,
      activity_name: activity.activity_name.clone(),
      input,
      attempt,
      visible_at: after(Utc::now(), delay),
      max_deliveries: self.max_attempts(activity),
    };
    Ok(self.queue.enqueue(task).await?)
  }

  /// Enqueue an attempt of an activity step and record it.
  async fn dispatch(
    &self,
    instance: WorkflowInstance,
    activity: &ActivityStep,
    index: u32,
    attempt: u32,
    outputs: &HashMap<String, Value>,
    retry: Option<Retry>,
  ) -> Result<WorkflowInstance, EngineError> {
    let delay = retry.as_ref().map(|r| r.delay).unwrap_or_default();
    let task = match self
      .enqueue(&instance, activity, index, attempt, outputs, delay)
      .await
    {
      Ok(task) => task,
      Err(EngineError::Input { message, .. }) => {
        let failure = Failure::new(FailureKind::Definition, message, Some(index));
        return self.fail_instance(instance, Vec::new(), failure).await;
      }
      Err(e) => return Err(e),
    };

    let mut events = Vec::with_capacity(2);
    if let Some(retry) = retry {
      warn!(
        step_index = index,
        attempt = retry.attempt,
        error = %retry.error,
        retry_at = %task.visible_at,
        "activity_retry_scheduled"
      );
      events.push(EventKind::ActivityRetried {
        step_index: index,
        attempt: retry.attempt,
        idempotency_key: retry.idempotency_key,
        error: retry.error,
        retry_at: task.visible_at,
      });
    }
    events.push(EventKind::StepStarted {
      step_index: index,
      step_id: activity.step_id.clone(),
      activity_name: activity.activity_name.clone(),
      attempt,
      idempotency_key: task.idempotency_key.clone(),
    });

    let appended = self
      .store
      .append_events(&instance.instance_id, instance.version, events, instance.state())
      .await;
    let instance = match appended {
      Ok(instance) => instance,
      Err(e) => {
        // The task is already queued. If another writer finished the
        // instance meanwhile, nothing will ever record or cancel it.
        self.retire_orphans(&instance.instance_id).await?;
        return Err(e.into());
      }
    };

    info!(
      step_index = index,
      activity = %activity.activity_name,
      attempt,
      idempotency_key = %task.idempotency_key,
      queue = %task.queue,
      "activity_dispatched"
    );
    self.notify(EngineEvent::StepDispatched {
      instance_id: instance.instance_id.clone(),
      step_index: index,
      activity_name: activity.activity_name.clone(),
      attempt,
    });
    Ok(instance)
  }

  /// Cancel the pending tasks of an instance that reached a terminal status
  /// after this invocation read it.
  ///
  /// A cancel that commits after this check retires the pending tasks
  /// itself.
  async fn retire_orphans(&self, instance_id: &str) -> Result<(), EngineError> {
    let current = self.store.load(instance_id).await?;
    if !current.status.is_terminal() {
      return Ok(());
    }

    let retired = self.queue.cancel_pending(instance_id).await?;
    if retired > 0 {
      warn!(status = %current.status, tasks_cancelled = retired, "orphan_tasks_cancelled");
    }
    Ok(())
  }

  /// Suspend on a signal step. Nothing is left running.
  async fn suspend(
    &self,
    instance: WorkflowInstance,
    index: u32,
    wait: &SignalStep,
  ) -> Result<WorkflowInstance, EngineError> {
    let deadline_at = wait.deadline().map(|d| after(Utc::now(), d));

    let mut state = instance.state().with_status(InstanceStatus::WaitingSignal);
    state.awaited_signal = Some(wait.signal_name.clone());
    state.deadline_at = deadline_at;

    let instance = self
      .store
      .append_events(
        &instance.instance_id,
        instance.version,
        vec![EventKind::WaitingSignal {
          step_index: index,
          signal_name: wait.signal_name.clone(),
          deadline_at,
        }],
        state,
      )
      .await?;

    info!(
      step_index = index,
      signal = %wait.signal_name,
      deadline_at = ?deadline_at,
      "workflow_waiting_signal"
    );
    self.notify(EngineEvent::WaitingSignal {
      instance_id: instance.instance_id.clone(),
      signal_name: wait.signal_name.clone(),
    });
    Ok(instance)
  }

  async fn complete_instance(
    &self,
    instance: WorkflowInstance,
    workflow: &Workflow,
    outputs: &HashMap<String, Value>,
  ) -> Result<WorkflowInstance, EngineError> {
    // The output of the last step, whether an activity result or a signal
    // payload.
    let output = workflow
      .steps
      .last()
      .and_then(|step| outputs.get(step.step_id()))
      .cloned()
      .unwrap_or(Value::Null);

    let mut state = instance.state().with_status(InstanceStatus::Completed);
    state.output = Some(output.clone());

    let instance = self
      .store
      .append_events(
        &instance.instance_id,
        instance.version,
        vec![EventKind::WorkflowCompleted {
          output: output.clone(),
        }],
        state,
      )
      .await?;

    info!(output = %output, "workflow_completed");
    self.notify(EngineEvent::InstanceCompleted {
      instance_id: instance.instance_id.clone(),
      output,
    });
    Ok(instance)
  }

  /// Append `events` followed by `WorkflowFailed` and move to `Failed`.
  pub(crate) async fn fail_instance(
    &self,
    instance: WorkflowInstance,
    mut events: Vec<EventKind>,
    failure: Failure,
  ) -> Result<WorkflowInstance, EngineError> {
    events.push(EventKind::WorkflowFailed {
      failure: failure.clone(),
    });

    let mut state = instance
      .state()
      .clear_wait()
      .with_status(InstanceStatus::Failed);
    state.error = Some(failure.clone());

    let instance = self
      .store
      .append_events(&instance.instance_id, instance.version, events, state)
      .await?;

    warn!(
      kind = ?failure.kind,
      step_index = ?failure.step_index,
      error = %failure.message,
      "workflow_failed"
    );
    self.notify(EngineEvent::InstanceFailed {
      instance_id: instance.instance_id.clone(),
      failure,
    });
    Ok(instance)
  }

  /// Cancel an instance and retire its pending tasks.
  ///
  /// Cancelling an already cancelled instance is a no-op. Activities that are
  /// already running finish, but their results are discarded.
  #[instrument(name = "executor_cancel", skip(self, reason), fields(instance_id = %instance_id))]
  pub async fn cancel(
    &self,
    instance_id: &str,
    reason: Option<String>,
  ) -> Result<WorkflowInstance, EngineError> {
    let attempts = self.config.max_conflict_retries + 1;
    for attempt in 1..=attempts {
      let instance = self.store.load(instance_id).await?;
      match instance.status {
        InstanceStatus::Cancelled => return Ok(instance),
        InstanceStatus::Completed | InstanceStatus::Failed => {
          return Err(EngineError::Terminal {
            instance_id: instance_id.to_string(),
            status: instance.status,
          });
        }
        _ => {}
      }

      let state = instance
        .state()
        .clear_wait()
        .with_status(InstanceStatus::Cancelled);
      let appended = self
        .store
        .append_events(
          instance_id,
          instance.version,
          vec![EventKind::Cancelled {
            reason: reason.clone(),
          }],
          state,
        )
        .await;

      match appended {
        Ok(instance) => {
          let retired = self.queue.cancel_pending(instance_id).await?;
          info!(tasks_cancelled = retired, "workflow_cancelled");
          self.notify(EngineEvent::InstanceCancelled {
            instance_id: instance_id.to_string(),
          });
          return Ok(instance);
        }
        Err(e) if e.is_conflict() => {
          debug!(attempt, "cancel_conflict");
          self.conflict_backoff(attempt).await;
        }
        Err(e) => return Err(e.into()),
      }
    }

    Err(EngineError::Conflict {
      instance_id: instance_id.to_string(),
      attempts,
    })
  }

  /// Re-evaluate every non-terminal instance from stored state.
  ///
  /// Returns the number of instances evaluated. Failures are logged and do
  /// not stop the pass.
  #[instrument(name = "executor_recover", skip(self))]
  pub async fn recover(&self) -> Result<usize, EngineError> {
    let active = self.store.list_active().await?;
    info!(count = active.len(), "recovery_started");

    for instance in &active {
      if let Err(e) = self.advance(&instance.instance_id).await {
        warn!(instance_id = %instance.instance_id, error = %e, "recovery_advance_failed");
      }
    }
    Ok(active.len())
  }

  /// Fail every instance whose signal deadline is at or before `now`.
  ///
  /// Returns the number of instances timed out.
  #[instrument(name = "executor_expire_waits", skip(self))]
  pub async fn expire_waits(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
    let expired = self.store.list_expired_waits(now).await?;
    let mut timed_out = 0;

    for instance in expired {
      match self.time_out(&instance.instance_id, now).await {
        Ok(true) => timed_out += 1,
        Ok(false) => {}
        Err(e) => {
          warn!(instance_id = %instance.instance_id, error = %e, "signal_timeout_failed");
        }
      }
    }
    Ok(timed_out)
  }

  async fn time_out(&self, instance_id: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
    let attempts = self.config.max_conflict_retries + 1;
    for attempt in 1..=attempts {
      let instance = self.store.load(instance_id).await?;
      let expired = instance.status == InstanceStatus::WaitingSignal
        && instance.deadline_at.is_some_and(|d| d <= now);
      if !expired {
        // A signal won the race.
        return Ok(false);
      }

      let index = instance.current_step_index;
      let signal_name = instance.awaited_signal.clone().unwrap_or_default();
      let failure = Failure::new(
        FailureKind::Timeout,
        format!("signal '{}' not received before deadline", signal_name),
        Some(index),
      );
      let timed_out = EventKind::SignalTimedOut {
        step_index: index,
        signal_name,
      };

      match self.fail_instance(instance, vec![timed_out], failure).await {
        Ok(_) => return Ok(true),
        Err(e) if e.is_conflict() => self.conflict_backoff(attempt).await,
        Err(e) => return Err(e),
      }
    }

    Err(EngineError::Conflict {
      instance_id: instance_id.to_string(),
      attempts,
    })
  }

  /// Retire tasks whose final lease lapsed and advance their instances,
  /// which fails the owning steps.
  ///
  /// Returns the number of tasks retired.
  #[instrument(name = "executor_reap_leases", skip(self))]
  pub async fn reap_leases(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
    let reaped = self.queue.reap_expired(now).await?;

    for task in &reaped {
      warn!(
        task_id = %task.task_id,
        instance_id = %task.instance_id,
        step_index = task.step_index,
        deliveries = task.deliveries,
        "task_lease_exhausted"
      );
      if let Err(e) = self.advance(&task.instance_id).await {
        warn!(instance_id = %task.instance_id, error = %e, "lease_reap_advance_failed");
      }
    }
    Ok(reaped.len())
  }
}

/// Outputs of completed steps, keyed by step id: activity results and
/// received signal payloads.
fn step_outputs(workflow: &Workflow, history: &[Event]) -> HashMap<String, Value> {
  let mut outputs = HashMap::new();
  for event in history {
    let (index, value) = match &event.kind {
      EventKind::ActivityCompleted {
        step_index, output, ..
      } => (*step_index, output),
      EventKind::SignalReceived {
        step_index, payload, ..
      } => (*step_index, payload),
      _ => continue,
    };
    if let Some(step) = workflow.step(index as usize) {
      outputs.insert(step.step_id().to_string(), value.clone());
    }
  }
  outputs
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(delay)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
