//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marigold_config::{EngineConfig, RetryPolicy, StepDef, StepKind, WorkflowDef};
use marigold_engine::Engine;
use marigold_queue::{MemoryQueue, Task, TaskQueue};
use marigold_store::{InstanceStore, MemoryStore};
use marigold_worker::WorkerClient;
use marigold_workflow::DefinitionRegistry;

pub const LEASE: Duration = Duration::from_secs(30);

pub fn wait_step(step_id: &str, signal_name: &str, deadline_ms: Option<u64>) -> StepDef {
  StepDef {
    step_id: step_id.to_string(),
    kind: StepKind::WaitForSignal {
      signal_name: signal_name.to_string(),
      deadline_ms,
      approval_field: Some("approved".to_string()),
    },
  }
}

pub fn activity_step(step_id: &str, activity_name: &str, inputs: &[(&str, &str)]) -> StepDef {
  StepDef {
    step_id: step_id.to_string(),
    kind: StepKind::Activity {
      activity_name: activity_name.to_string(),
      inputs: inputs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>(),
      queue: None,
      max_attempts: None,
    },
  }
}

/// Approval gate followed by `create_user`.
pub fn onboarding() -> WorkflowDef {
  WorkflowDef {
    name: "onboarding".to_string(),
    version: 1,
    steps: vec![
      wait_step("approval", "onboarding-approval", None),
      activity_step(
        "create_user",
        "create_user",
        &[
          ("firstname", "{{ input.firstname }}"),
          ("lastname", "{{ input.lastname }}"),
        ],
      ),
    ],
  }
}

/// A single activity that receives the workflow input unchanged.
pub fn single(name: &str, activity_name: &str) -> WorkflowDef {
  WorkflowDef {
    name: name.to_string(),
    version: 1,
    steps: vec![activity_step("only", activity_name, &[])],
  }
}

pub fn definitions(defs: Vec<WorkflowDef>) -> Arc<DefinitionRegistry> {
  let mut registry = DefinitionRegistry::new();
  for def in defs {
    registry.register(def).unwrap();
  }
  Arc::new(registry)
}

/// Retries become visible immediately.
pub fn config() -> EngineConfig {
  EngineConfig {
    retry: RetryPolicy {
      max_attempts: 3,
      initial_backoff_ms: 0,
      max_backoff_ms: 0,
      jitter: 0.0,
      ..RetryPolicy::default()
    },
    ..EngineConfig::default()
  }
}

pub struct Harness {
  pub engine: Arc<Engine>,
  pub store: Arc<dyn InstanceStore>,
  pub queue: Arc<dyn TaskQueue>,
}

impl Harness {
  pub fn memory(defs: Vec<WorkflowDef>) -> Self {
    Self::with_config(defs, config())
  }

  pub fn with_config(defs: Vec<WorkflowDef>, config: EngineConfig) -> Self {
    Self::with_backends(
      defs,
      config,
      Arc::new(MemoryStore::new()),
      Arc::new(MemoryQueue::new()),
    )
  }

  pub fn with_backends(
    defs: Vec<WorkflowDef>,
    config: EngineConfig,
    store: Arc<dyn InstanceStore>,
    queue: Arc<dyn TaskQueue>,
  ) -> Self {
    let engine = Arc::new(Engine::new(
      store.clone(),
      queue.clone(),
      definitions(defs),
      config,
    ));
    Self {
      engine,
      store,
      queue,
    }
  }

  /// Lease every ready task on the default queue through the worker protocol.
  pub async fn poll(&self) -> Vec<Task> {
    self.engine.poll("default", 10, LEASE).await.unwrap()
  }

  /// Lease exactly one ready task.
  pub async fn poll_one(&self) -> Task {
    let mut tasks = self.poll().await;
    assert_eq!(tasks.len(), 1, "expected one ready task, got {:?}", tasks);
    tasks.remove(0)
  }

  pub async fn event_names(&self, instance_id: &str) -> Vec<&'static str> {
    self
      .store
      .history(instance_id)
      .await
      .unwrap()
      .iter()
      .map(|e| e.kind.name())
      .collect()
  }
}
