//! Behaviour every `InstanceStore` must share, run against both backends.

use std::sync::Arc;

use marigold_store::{
  EventKind, Failure, FailureKind, InstanceState, InstanceStatus, InstanceStore, MemoryStore,
  NewInstance, SqliteStore, StoreError, connect,
};
use serde_json::json;

async fn sqlite_store() -> SqliteStore {
  let pool = connect("sqlite::memory:").await.unwrap();
  let store = SqliteStore::new(pool);
  store.migrate().await.unwrap();
  store
}

fn new_instance(id: &str, key: Option<&str>) -> NewInstance {
  NewInstance {
    instance_id: id.to_string(),
    definition_name: "onboarding".to_string(),
    definition_version: 1,
    input: json!({ "firstname": "Ada", "lastname": "Lovelace" }),
    idempotency_key: key.map(str::to_string),
  }
}

fn running(step: u32) -> InstanceState {
  InstanceState {
    status: InstanceStatus::Running,
    current_step_index: step,
    output: None,
    error: None,
    awaited_signal: None,
    deadline_at: None,
  }
}

async fn check_create_is_idempotent(store: &dyn InstanceStore) {
  let first = store.create(new_instance("a", Some("key-1"))).await.unwrap();
  assert!(first.is_new());

  let second = store.create(new_instance("b", Some("key-1"))).await.unwrap();
  assert!(!second.is_new());
  assert_eq!(second.instance().instance_id, "a");

  assert!(matches!(
    store.load("b").await,
    Err(StoreError::NotFound(_))
  ));
  assert_eq!(store.list_active().await.unwrap().len(), 1);
}

async fn check_append_bumps_version_and_sequences(store: &dyn InstanceStore) {
  store.create(new_instance("a", None)).await.unwrap();

  let after = store
    .append_events("a", 1, vec![EventKind::Started], running(0))
    .await
    .unwrap();
  assert_eq!(after.version, 2);
  assert_eq!(after.status, InstanceStatus::Running);

  store
    .append_events(
      "a",
      2,
      vec![
        EventKind::StepStarted {
          step_index: 0,
          step_id: "create_user".to_string(),
          activity_name: "create_user".to_string(),
          attempt: 1,
          idempotency_key: "a:0:1".to_string(),
        },
        EventKind::ActivityCompleted {
          step_index: 0,
          attempt: 1,
          idempotency_key: "a:0:1".to_string(),
          output: json!("Ada Lovelace"),
        },
      ],
      running(1),
    )
    .await
    .unwrap();

  let history = store.history("a").await.unwrap();
  let sequences: Vec<u64> = history.iter().map(|e| e.sequence).collect();
  assert_eq!(sequences, vec![1, 2, 3, 4]);
  assert!(matches!(history[0].kind, EventKind::InstanceCreated { .. }));
  assert!(matches!(history[3].kind, EventKind::ActivityCompleted { .. }));

  let loaded = store.load("a").await.unwrap();
  assert_eq!(loaded.version, 3);
  assert_eq!(loaded.current_step_index, 1);
}

async fn check_stale_version_conflicts_without_writing(store: &dyn InstanceStore) {
  store.create(new_instance("a", None)).await.unwrap();
  store
    .append_events("a", 1, vec![EventKind::Started], running(0))
    .await
    .unwrap();

  let err = store
    .append_events("a", 1, vec![EventKind::Started], running(0))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    StoreError::Conflict {
      expected: 1,
      actual: 2,
      ..
    }
  ));

  assert_eq!(store.history("a").await.unwrap().len(), 2);
  assert_eq!(store.load("a").await.unwrap().version, 2);
}

async fn check_invalid_transition_is_rejected(store: &dyn InstanceStore) {
  store.create(new_instance("a", None)).await.unwrap();

  // Created cannot complete without running.
  let completed = running(0).with_status(InstanceStatus::Completed);
  let err = store
    .append_events(
      "a",
      1,
      vec![EventKind::WorkflowCompleted { output: json!(1) }],
      completed,
    )
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::InvalidTransition { .. }));

  // Terminal instances accept nothing further.
  store
    .append_events("a", 1, vec![EventKind::Started], running(0))
    .await
    .unwrap();
  let mut failed = running(0).with_status(InstanceStatus::Failed);
  failed.error = Some(Failure::new(FailureKind::Activity, "boom", Some(0)));
  store
    .append_events(
      "a",
      2,
      vec![EventKind::WorkflowFailed {
        failure: failed.error.clone().unwrap(),
      }],
      failed,
    )
    .await
    .unwrap();

  let err = store
    .append_events(
      "a",
      3,
      vec![EventKind::Cancelled { reason: None }],
      running(0).with_status(InstanceStatus::Cancelled),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::InvalidTransition { .. }));

  let loaded = store.load("a").await.unwrap();
  assert_eq!(loaded.status, InstanceStatus::Failed);
  assert_eq!(loaded.error.unwrap().message, "boom");
}

async fn check_list_active_skips_terminal(store: &dyn InstanceStore) {
  store.create(new_instance("a", None)).await.unwrap();
  store.create(new_instance("b", None)).await.unwrap();
  store
    .append_events(
      "b",
      1,
      vec![EventKind::Cancelled { reason: None }],
      running(0).with_status(InstanceStatus::Cancelled),
    )
    .await
    .unwrap();

  let active = store.list_active().await.unwrap();
  assert_eq!(active.len(), 1);
  assert_eq!(active[0].instance_id, "a");
}

async fn check_missing_instance(store: &dyn InstanceStore) {
  assert!(matches!(
    store.load("nope").await,
    Err(StoreError::NotFound(_))
  ));
  assert!(matches!(
    store.history("nope").await,
    Err(StoreError::NotFound(_))
  ));
  assert!(matches!(
    store
      .append_events("nope", 1, vec![EventKind::Started], running(0))
      .await,
    Err(StoreError::NotFound(_))
  ));
}

async fn check_concurrent_appends_have_one_winner(store: Arc<dyn InstanceStore>) {
  store.create(new_instance("a", None)).await.unwrap();

  let mut handles = Vec::new();
  for _ in 0..8 {
    let store = store.clone();
    handles.push(tokio::spawn(async move {
      store
        .append_events("a", 1, vec![EventKind::Started], running(0))
        .await
    }));
  }

  let mut wins = 0;
  let mut conflicts = 0;
  for handle in handles {
    match handle.await.unwrap() {
      Ok(_) => wins += 1,
      Err(e) if e.is_conflict() => conflicts += 1,
      Err(e) => panic!("unexpected error: {}", e),
    }
  }

  assert_eq!(wins, 1);
  assert_eq!(conflicts, 7);
  assert_eq!(store.history("a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_memory_store_contract() {
  check_create_is_idempotent(&MemoryStore::new()).await;
  check_append_bumps_version_and_sequences(&MemoryStore::new()).await;
  check_stale_version_conflicts_without_writing(&MemoryStore::new()).await;
  check_invalid_transition_is_rejected(&MemoryStore::new()).await;
  check_list_active_skips_terminal(&MemoryStore::new()).await;
  check_missing_instance(&MemoryStore::new()).await;
  check_concurrent_appends_have_one_winner(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
  check_create_is_idempotent(&sqlite_store().await).await;
  check_append_bumps_version_and_sequences(&sqlite_store().await).await;
  check_stale_version_conflicts_without_writing(&sqlite_store().await).await;
  check_invalid_transition_is_rejected(&sqlite_store().await).await;
  check_list_active_skips_terminal(&sqlite_store().await).await;
  check_missing_instance(&sqlite_store().await).await;
  check_concurrent_appends_have_one_winner(Arc::new(sqlite_store().await)).await;
}

#[tokio::test]
async fn test_sqlite_state_survives_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("marigold.db").display());

  {
    let store = SqliteStore::new(connect(&url).await.unwrap());
    store.migrate().await.unwrap();
    store.create(new_instance("a", Some("k"))).await.unwrap();
    store
      .append_events("a", 1, vec![EventKind::Started], running(0))
      .await
      .unwrap();
  }

  let store = SqliteStore::new(connect(&url).await.unwrap());
  store.migrate().await.unwrap();
  let loaded = store.load("a").await.unwrap();
  assert_eq!(loaded.status, InstanceStatus::Running);
  assert_eq!(loaded.version, 2);
  assert_eq!(store.history("a").await.unwrap().len(), 2);

  let again = store.create(new_instance("b", Some("k"))).await.unwrap();
  assert_eq!(again.instance().instance_id, "a");
}
