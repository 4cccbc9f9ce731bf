//! The engine facade: the operations callers and workers use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marigold_config::EngineConfig;
use marigold_queue::{QueueError, Task, TaskQueue};
use marigold_store::{Event, InstanceStatus, InstanceStore, NewInstance, WorkflowInstance};
use marigold_worker::{ActivityError, WorkerClient, WorkerError};
use marigold_workflow::{DefinitionRegistry, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, SignalError};
use crate::events::{EngineNotifier, NoopNotifier};
use crate::executor::Executor;
use crate::signal::SignalRouter;

/// An instance together with its full event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowView {
  pub instance: WorkflowInstance,
  pub history: Vec<Event>,
}

/// The durable workflow engine.
///
/// Holds no per-instance state: any number of engines may share the same
/// store and queue, and each can serve starts, signals and worker reports for
/// any instance.
pub struct Engine {
  executor: Arc<Executor>,
  signals: SignalRouter,
}

impl Engine {
  /// Create an engine that discards engine events.
  pub fn new(
    store: Arc<dyn InstanceStore>,
    queue: Arc<dyn TaskQueue>,
    definitions: Arc<DefinitionRegistry>,
    config: EngineConfig,
  ) -> Self {
    Self::with_notifier(store, queue, definitions, config, Arc::new(NoopNotifier))
  }

  pub fn with_notifier(
    store: Arc<dyn InstanceStore>,
    queue: Arc<dyn TaskQueue>,
    definitions: Arc<DefinitionRegistry>,
    config: EngineConfig,
    notifier: Arc<dyn EngineNotifier>,
  ) -> Self {
    let executor = Arc::new(Executor::new(store, queue, definitions, config, notifier));
    Self {
      signals: SignalRouter::new(executor.clone()),
      executor,
    }
  }

  pub fn executor(&self) -> &Arc<Executor> {
    &self.executor
  }

  pub fn config(&self) -> &EngineConfig {
    self.executor.config()
  }

  /// Start an instance of a registered definition and return its id.
  ///
  /// With an `idempotency_key`, repeated calls return the id of the instance
  /// created by the first one.
  #[instrument(name = "engine_start_workflow", skip(self, input, idempotency_key))]
  pub async fn start_workflow(
    &self,
    name: &str,
    version: u32,
    input: Value,
    idempotency_key: Option<String>,
  ) -> Result<String, EngineError> {
    self
      .executor
      .definitions()
      .lookup(name, version)
      .map_err(|e| match e {
        WorkflowError::NotFound { name, version } => {
          EngineError::DefinitionNotFound { name, version }
        }
        other => other.into(),
      })?;

    let outcome = self
      .executor
      .store()
      .create(NewInstance {
        instance_id: uuid::Uuid::new_v4().to_string(),
        definition_name: name.to_string(),
        definition_version: version,
        input,
        idempotency_key,
      })
      .await?;

    let instance_id = outcome.instance().instance_id.clone();
    if outcome.is_new() {
      info!(instance_id = %instance_id, "workflow_created");
    } else {
      info!(instance_id = %instance_id, "workflow_start_deduplicated");
    }

    // Advancing an existing instance too covers a first start that crashed
    // before it got this far. The instance is durable either way, so a
    // failure here is left to recovery.
    if let Err(e) = self.executor.advance(&instance_id).await {
      warn!(instance_id = %instance_id, error = %e, "workflow_start_advance_failed");
    }
    Ok(instance_id)
  }

  /// Deliver a signal to a waiting instance.
  pub async fn signal_workflow(
    &self,
    instance_id: &str,
    signal_name: &str,
    payload: Value,
  ) -> Result<WorkflowInstance, SignalError> {
    self
      .signals
      .receive_signal(instance_id, signal_name, payload)
      .await
  }

  /// The last committed state of an instance and its history.
  pub async fn get_workflow(&self, instance_id: &str) -> Result<WorkflowView, EngineError> {
    let store = self.executor.store();
    let instance = store.load(instance_id).await?;
    let history = store.history(instance_id).await?;
    Ok(WorkflowView { instance, history })
  }

  /// Cancel an instance.
  ///
  /// Returns once the cancellation is committed. Activities already running
  /// are not interrupted; their results are discarded.
  pub async fn cancel_workflow(
    &self,
    instance_id: &str,
    reason: Option<String>,
  ) -> Result<WorkflowInstance, EngineError> {
    self.executor.cancel(instance_id, reason).await
  }

  /// Advance the instance that owns a task after its result was recorded.
  async fn resume(&self, task: &Task) {
    match self.executor.advance(&task.instance_id).await {
      Ok(instance) if instance.status == InstanceStatus::Cancelled => {
        info!(
          task_id = %task.task_id,
          instance_id = %task.instance_id,
          "activity_result_discarded"
        );
      }
      Ok(_) => {}
      // The result is durable in the task record, so recovery will retry.
      Err(e) => {
        warn!(
          task_id = %task.task_id,
          instance_id = %task.instance_id,
          error = %e,
          "activity_result_advance_failed"
        );
      }
    }
  }
}

fn worker_error(task_id: &str, e: QueueError) -> WorkerError {
  match e {
    QueueError::Retired { .. } => WorkerError::LeaseLost {
      task_id: task_id.to_string(),
      reason: e.to_string(),
    },
    other => WorkerError::Client(other.to_string()),
  }
}

#[async_trait]
impl WorkerClient for Engine {
  async fn poll(
    &self,
    queue: &str,
    max_tasks: usize,
    lease: Duration,
  ) -> Result<Vec<Task>, WorkerError> {
    self
      .executor
      .queue()
      .poll(queue, max_tasks, lease)
      .await
      .map_err(|e| WorkerError::Client(e.to_string()))
  }

  async fn heartbeat(&self, task_id: &str, lease: Duration) -> Result<(), WorkerError> {
    self
      .executor
      .queue()
      .heartbeat(task_id, lease)
      .await
      .map(|_| ())
      .map_err(|e| worker_error(task_id, e))
  }

  async fn complete(&self, task_id: &str, output: Value) -> Result<(), WorkerError> {
    let task = self
      .executor
      .queue()
      .complete(task_id, output)
      .await
      .map_err(|e| worker_error(task_id, e))?;
    self.resume(&task).await;
    Ok(())
  }

  async fn fail(&self, task_id: &str, error: &ActivityError) -> Result<(), WorkerError> {
    let task = self
      .executor
      .queue()
      .fail(task_id, &error.message, !error.non_retryable)
      .await
      .map_err(|e| worker_error(task_id, e))?;
    self.resume(&task).await;
    Ok(())
  }
}
