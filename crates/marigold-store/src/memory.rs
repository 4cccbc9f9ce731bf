use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{
  CreateOutcome, Event, EventKind, InstanceState, InstanceStatus, NewInstance, WorkflowInstance,
};
use crate::{InstanceStore, StoreError, check_append};

#[derive(Default)]
struct Inner {
  instances: HashMap<String, WorkflowInstance>,
  events: HashMap<String, Vec<Event>>,
  /// idempotency key -> instance id
  keys: HashMap<String, String>,
}

/// In-memory store. Every operation takes a single lock, so appends are
/// atomic with respect to each other.
#[derive(Default)]
pub struct MemoryStore {
  inner: RwLock<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl InstanceStore for MemoryStore {
  async fn create(&self, new: NewInstance) -> Result<CreateOutcome, StoreError> {
    let mut inner = self.inner.write().await;

    if let Some(key) = &new.idempotency_key {
      if let Some(existing) = inner.keys.get(key).and_then(|id| inner.instances.get(id)) {
        return Ok(CreateOutcome::Existing(existing.clone()));
      }
    }

    let now = Utc::now();
    let instance = WorkflowInstance {
      instance_id: new.instance_id.clone(),
      definition_name: new.definition_name.clone(),
      definition_version: new.definition_version,
      status: InstanceStatus::Created,
      current_step_index: 0,
      input: new.input.clone(),
      output: None,
      error: None,
      awaited_signal: None,
      deadline_at: None,
      idempotency_key: new.idempotency_key.clone(),
      version: 1,
      created_at: now,
      updated_at: now,
    };
    let created = Event {
      instance_id: new.instance_id.clone(),
      sequence: 1,
      kind: EventKind::InstanceCreated {
        definition_name: new.definition_name,
        definition_version: new.definition_version,
        input: new.input,
      },
      recorded_at: now,
    };

    if let Some(key) = new.idempotency_key {
      inner.keys.insert(key, new.instance_id.clone());
    }
    inner.events.insert(new.instance_id.clone(), vec![created]);
    inner.instances.insert(new.instance_id, instance.clone());

    Ok(CreateOutcome::Created(instance))
  }

  async fn load(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError> {
    let inner = self.inner.read().await;
    inner
      .instances
      .get(instance_id)
      .cloned()
      .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))
  }

  async fn append_events(
    &self,
    instance_id: &str,
    expected_version: u64,
    events: Vec<EventKind>,
    state: InstanceState,
  ) -> Result<WorkflowInstance, StoreError> {
    let mut guard = self.inner.write().await;
    let inner = &mut *guard;

    let instance = inner
      .instances
      .get_mut(instance_id)
      .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))?;
    check_append(instance, expected_version, &state)?;

    let now = Utc::now();
    let history = inner.events.entry(instance_id.to_string()).or_default();
    let mut sequence = history.last().map(|e| e.sequence).unwrap_or(0);
    for kind in events {
      sequence += 1;
      history.push(Event {
        instance_id: instance_id.to_string(),
        sequence,
        kind,
        recorded_at: now,
      });
    }

    instance.apply(state, now);
    Ok(instance.clone())
  }

  async fn history(&self, instance_id: &str) -> Result<Vec<Event>, StoreError> {
    let inner = self.inner.read().await;
    if !inner.instances.contains_key(instance_id) {
      return Err(StoreError::NotFound(instance_id.to_string()));
    }
    Ok(inner.events.get(instance_id).cloned().unwrap_or_default())
  }

  async fn list_active(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
    let inner = self.inner.read().await;
    let mut active: Vec<_> = inner
      .instances
      .values()
      .filter(|i| !i.status.is_terminal())
      .cloned()
      .collect();
    active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(active)
  }

  async fn list_expired_waits(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<WorkflowInstance>, StoreError> {
    let inner = self.inner.read().await;
    let mut expired: Vec<_> = inner
      .instances
      .values()
      .filter(|i| i.status == InstanceStatus::WaitingSignal)
      .filter(|i| i.deadline_at.is_some_and(|d| d <= now))
      .cloned()
      .collect();
    expired.sort_by(|a, b| a.deadline_at.cmp(&b.deadline_at));
    Ok(expired)
  }
}
