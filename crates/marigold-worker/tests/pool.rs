use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use marigold_config::RetryPolicy;
use marigold_queue::{MemoryQueue, NewTask, QueueError, Task, TaskQueue, TaskStatus};
use marigold_worker::{
  ActivityError, ActivityRegistry, WorkerClient, WorkerConfig, WorkerError, WorkerPool,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Worker client that talks straight to a queue.
struct QueueClient {
  queue: Arc<MemoryQueue>,
  failing_polls: AtomicU32,
  heartbeats: AtomicU32,
}

impl QueueClient {
  fn new(queue: Arc<MemoryQueue>) -> Self {
    Self {
      queue,
      failing_polls: AtomicU32::new(0),
      heartbeats: AtomicU32::new(0),
    }
  }
}

fn map_err(task_id: &str, e: QueueError) -> WorkerError {
  match e {
    QueueError::Retired { .. } => WorkerError::LeaseLost {
      task_id: task_id.to_string(),
      reason: e.to_string(),
    },
    other => WorkerError::Client(other.to_string()),
  }
}

#[async_trait]
impl WorkerClient for QueueClient {
  async fn poll(
    &self,
    queue: &str,
    max_tasks: usize,
    lease: Duration,
  ) -> Result<Vec<Task>, WorkerError> {
    let remaining = self.failing_polls.load(Ordering::SeqCst);
    if remaining > 0 {
      self.failing_polls.store(remaining - 1, Ordering::SeqCst);
      return Err(WorkerError::Client("store unavailable".to_string()));
    }
    self
      .queue
      .poll(queue, max_tasks, lease)
      .await
      .map_err(|e| WorkerError::Client(e.to_string()))
  }

  async fn heartbeat(&self, task_id: &str, lease: Duration) -> Result<(), WorkerError> {
    self.heartbeats.fetch_add(1, Ordering::SeqCst);
    self
      .queue
      .heartbeat(task_id, lease)
      .await
      .map(|_| ())
      .map_err(|e| map_err(task_id, e))
  }

  async fn complete(&self, task_id: &str, output: Value) -> Result<(), WorkerError> {
    self
      .queue
      .complete(task_id, output)
      .await
      .map(|_| ())
      .map_err(|e| map_err(task_id, e))
  }

  async fn fail(&self, task_id: &str, error: &ActivityError) -> Result<(), WorkerError> {
    self
      .queue
      .fail(task_id, &error.message, !error.non_retryable)
      .await
      .map(|_| ())
      .map_err(|e| map_err(task_id, e))
  }
}

fn config(lease_ms: u64, concurrency: usize) -> WorkerConfig {
  WorkerConfig {
    queues: vec!["default".to_string()],
    concurrency,
    max_tasks_per_poll: 10,
    lease: Duration::from_millis(lease_ms),
    poll_interval: Duration::from_millis(10),
    backoff: RetryPolicy {
      initial_backoff_ms: 5,
      max_backoff_ms: 20,
      ..RetryPolicy::default()
    },
  }
}

async fn enqueue(queue: &MemoryQueue, instance_id: &str, activity: &str, input: Value) -> Task {
  queue
    .enqueue(NewTask {
      queue: "default".to_string(),
      instance_id: instance_id.to_string(),
      step_index: 0,
      activity_name: activity.to_string(),
      input,
      attempt: 1,
      visible_at: chrono::Utc::now(),
      max_deliveries: 3,
    })
    .await
    .unwrap()
}

async fn wait_for_status(queue: &MemoryQueue, task_id: &str, status: TaskStatus) -> Task {
  for _ in 0..200 {
    let task = queue.get(task_id).await.unwrap();
    if task.status == status {
      return task;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("task {} never reached {}", task_id, status);
}

fn start(pool: WorkerPool) -> (CancellationToken, tokio::task::JoinHandle<()>) {
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  let handle = tokio::spawn(async move { pool.run(token).await });
  (cancel, handle)
}

#[tokio::test]
async fn test_executes_and_completes_task() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));

  let mut registry = ActivityRegistry::new();
  registry.register_fn("create_user", |_ctx, input| async move {
    let first = input["firstname"].as_str().unwrap_or_default().to_string();
    let last = input["lastname"].as_str().unwrap_or_default().to_string();
    Ok(json!(format!("{} {}", first, last)))
  });

  let task = enqueue(
    &queue,
    "i-1",
    "create_user",
    json!({ "firstname": "Ada", "lastname": "Lovelace" }),
  )
  .await;

  let (cancel, handle) = start(WorkerPool::new(client, Arc::new(registry), config(1_000, 2)));
  let done = wait_for_status(&queue, &task.task_id, TaskStatus::Completed).await;
  assert_eq!(done.output, Some(json!("Ada Lovelace")));

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_unknown_activity_fails_without_retry() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));
  let task = enqueue(&queue, "i-1", "missing", json!({})).await;

  let (cancel, handle) = start(WorkerPool::new(
    client,
    Arc::new(ActivityRegistry::new()),
    config(1_000, 1),
  ));
  let failed = wait_for_status(&queue, &task.task_id, TaskStatus::Failed).await;
  assert!(!failed.retryable);
  assert!(failed.error.unwrap().contains("unknown activity"));

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_activity_error_is_reported_with_retryability() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));

  let mut registry = ActivityRegistry::new();
  registry.register_fn("flaky", |_ctx, _input| async move {
    Err(ActivityError::retryable("try again"))
  });
  let task = enqueue(&queue, "i-1", "flaky", json!(null)).await;

  let (cancel, handle) = start(WorkerPool::new(client, Arc::new(registry), config(1_000, 1)));
  let failed = wait_for_status(&queue, &task.task_id, TaskStatus::Failed).await;
  assert!(failed.retryable);
  assert_eq!(failed.error.as_deref(), Some("try again"));

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_hold_the_lease() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));

  let mut registry = ActivityRegistry::new();
  registry.register_fn("slow", |_ctx, _input| async move {
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(json!("done"))
  });
  let task = enqueue(&queue, "i-1", "slow", json!(null)).await;

  let (cancel, handle) = start(WorkerPool::new(
    client.clone(),
    Arc::new(registry),
    config(90, 1),
  ));

  // Well past the original lease, nobody else can lease the task.
  tokio::time::sleep(Duration::from_millis(150)).await;
  let stolen = queue
    .poll("default", 10, Duration::from_secs(1))
    .await
    .unwrap();
  assert!(stolen.is_empty());

  let done = wait_for_status(&queue, &task.task_id, TaskStatus::Completed).await;
  assert_eq!(done.deliveries, 1);
  assert!(client.heartbeats.load(Ordering::SeqCst) >= 2);

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_poll_errors_back_off_and_recover() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));
  client.failing_polls.store(3, Ordering::SeqCst);

  let mut registry = ActivityRegistry::new();
  registry.register_fn("echo", |_ctx, input| async move { Ok(input) });
  let task = enqueue(&queue, "i-1", "echo", json!(7)).await;

  let (cancel, handle) = start(WorkerPool::new(
    client.clone(),
    Arc::new(registry),
    config(1_000, 1),
  ));
  let done = wait_for_status(&queue, &task.task_id, TaskStatus::Completed).await;
  assert_eq!(done.output, Some(json!(7)));
  assert_eq!(client.failing_polls.load(Ordering::SeqCst), 0);

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));

  let mut registry = ActivityRegistry::new();
  {
    let running = running.clone();
    let peak = peak.clone();
    registry.register_fn("work", move |_ctx, _input| {
      let running = running.clone();
      let peak = peak.clone();
      async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(null))
      }
    });
  }

  let mut tasks = Vec::new();
  for n in 0..6 {
    tasks.push(enqueue(&queue, &format!("i-{}", n), "work", json!(n)).await);
  }

  let (cancel, handle) = start(WorkerPool::new(client, Arc::new(registry), config(1_000, 2)));
  for task in &tasks {
    wait_for_status(&queue, &task.task_id, TaskStatus::Completed).await;
  }
  assert!(peak.load(Ordering::SeqCst) <= 2);
  assert!(peak.load(Ordering::SeqCst) >= 1);

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_lets_running_activity_finish() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));

  let mut registry = ActivityRegistry::new();
  registry.register_fn("slow", |_ctx, _input| async move {
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(json!("finished"))
  });
  let task = enqueue(&queue, "i-1", "slow", json!(null)).await;

  let (cancel, handle) = start(WorkerPool::new(client, Arc::new(registry), config(1_000, 1)));

  // Wait until the task is leased, then stop the pool.
  for _ in 0..100 {
    if queue.get(&task.task_id).await.unwrap().deliveries > 0 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  cancel.cancel();
  handle.await.unwrap();

  let task = queue.get(&task.task_id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Completed);
  assert_eq!(task.output, Some(json!("finished")));
}

#[tokio::test]
async fn test_result_for_cancelled_task_is_discarded() {
  let queue = Arc::new(MemoryQueue::new());
  let client = Arc::new(QueueClient::new(queue.clone()));

  let mut registry = ActivityRegistry::new();
  registry.register_fn("slow", |_ctx, _input| async move {
    tokio::time::sleep(Duration::from_millis(80)).await;
    Ok(json!("late"))
  });
  let task = enqueue(&queue, "i-1", "slow", json!(null)).await;

  let (cancel, handle) = start(WorkerPool::new(client, Arc::new(registry), config(1_000, 1)));
  for _ in 0..100 {
    if queue.get(&task.task_id).await.unwrap().deliveries > 0 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  queue.cancel_pending("i-1").await.unwrap();

  tokio::time::sleep(Duration::from_millis(150)).await;
  let task = queue.get(&task.task_id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Cancelled);
  assert!(task.output.is_none());

  cancel.cancel();
  handle.await.unwrap();
}
