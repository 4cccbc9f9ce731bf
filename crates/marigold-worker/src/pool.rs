use std::sync::Arc;
use std::time::Duration;

use marigold_config::{EngineConfig, RetryPolicy};
use marigold_queue::Task;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::activity::{ActivityContext, ActivityError};
use crate::client::{WorkerClient, WorkerError};
use crate::registry::ActivityRegistry;

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Queues polled in turn.
  pub queues: Vec<String>,
  /// Maximum number of activities running at once.
  pub concurrency: usize,
  pub max_tasks_per_poll: usize,
  pub lease: Duration,
  pub poll_interval: Duration,
  /// Backoff for transient client errors.
  pub backoff: RetryPolicy,
}

impl WorkerConfig {
  pub fn from_engine_config(config: &EngineConfig) -> Self {
    Self {
      queues: vec![config.queue_name.clone()],
      concurrency: config.worker_concurrency,
      max_tasks_per_poll: config.max_tasks_per_poll,
      lease: config.lease(),
      poll_interval: config.poll_interval(),
      backoff: config.retry.clone(),
    }
  }

  pub fn with_queues(mut self, queues: Vec<String>) -> Self {
    self.queues = queues;
    self
  }

  /// Heartbeats are sent three times per lease so one lost heartbeat does
  /// not lose the lease.
  pub fn heartbeat_interval(&self) -> Duration {
    (self.lease / 3).max(Duration::from_millis(1))
  }
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self::from_engine_config(&EngineConfig::default())
  }
}

/// A fixed-size pool of activity executors.
///
/// One poll loop leases at most as many tasks as there are free execution
/// slots, runs each on its own tokio task, heartbeats while it runs and
/// reports the outcome through the [`WorkerClient`].
pub struct WorkerPool {
  client: Arc<dyn WorkerClient>,
  registry: Arc<ActivityRegistry>,
  config: WorkerConfig,
}

impl WorkerPool {
  pub fn new(
    client: Arc<dyn WorkerClient>,
    registry: Arc<ActivityRegistry>,
    config: WorkerConfig,
  ) -> Self {
    Self {
      client,
      registry,
      config,
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// Run until `cancel` fires. Activities already running are allowed to
  /// finish and report before this returns.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(
      queues = ?self.config.queues,
      concurrency = self.config.concurrency,
      activities = ?self.registry.names(),
      "worker_pool_started"
    );

    let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
    let mut running = JoinSet::new();
    let mut next_queue = 0usize;
    let mut consecutive_errors = 0u32;

    loop {
      // Reap finished executions so the set does not grow unbounded.
      while let Some(joined) = running.try_join_next() {
        if let Err(e) = joined {
          error!(error = %e, "activity_execution_panicked");
        }
      }

      let first = tokio::select! {
        _ = cancel.cancelled() => break,
        permit = slots.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };
      let capacity = (1 + slots.available_permits()).min(self.config.max_tasks_per_poll.max(1));

      let Some(queue) = self.queue_at(next_queue) else {
        warn!("worker_pool_has_no_queues");
        break;
      };
      next_queue = next_queue.wrapping_add(1);

      let polled = tokio::select! {
        _ = cancel.cancelled() => break,
        polled = self.client.poll(queue, capacity, self.config.lease) => polled,
      };

      match polled {
        Ok(tasks) if tasks.is_empty() => {
          consecutive_errors = 0;
          drop(first);
          // Only idle once every queue came back empty.
          let cycle_done = next_queue % self.config.queues.len() == 0;
          if cycle_done && !sleep_or_cancel(&cancel, self.config.poll_interval).await {
            break;
          }
        }
        Ok(tasks) => {
          consecutive_errors = 0;
          let mut first = Some(first);
          for task in tasks {
            let permit = match first.take() {
              Some(permit) => permit,
              None => match slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                // Never happens: this loop is the only acquirer and sized
                // the poll to the free slots. Leave the task to its lease.
                Err(_) => {
                  warn!(task_id = %task.task_id, "worker_pool_over_capacity");
                  continue;
                }
              },
            };

            let client = self.client.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            running.spawn(async move {
              execute_task(client, registry, config, task).await;
              drop(permit);
            });
          }
        }
        Err(e) => {
          drop(first);
          consecutive_errors += 1;
          let delay = self.config.backoff.backoff(consecutive_errors);
          warn!(queue = %queue, error = %e, retry_in_ms = delay.as_millis() as u64, "worker_poll_failed");
          if !sleep_or_cancel(&cancel, delay).await {
            break;
          }
        }
      }
    }

    debug!(in_flight = running.len(), "worker_pool_draining");
    while let Some(joined) = running.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "activity_execution_panicked");
      }
    }
    info!("worker_pool_stopped");
  }

  fn queue_at(&self, n: usize) -> Option<&str> {
    if self.config.queues.is_empty() {
      return None;
    }
    Some(&self.config.queues[n % self.config.queues.len()])
  }
}

/// Sleep for `duration`. Returns false if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
  tokio::select! {
    _ = cancel.cancelled() => false,
    _ = tokio::time::sleep(duration) => true,
  }
}

#[instrument(
  name = "worker_execute",
  skip(client, registry, config, task),
  fields(
    task_id = %task.task_id,
    instance_id = %task.instance_id,
    step_index = task.step_index,
    activity = %task.activity_name,
    attempt = task.attempt,
  )
)]
async fn execute_task(
  client: Arc<dyn WorkerClient>,
  registry: Arc<ActivityRegistry>,
  config: WorkerConfig,
  task: Task,
) {
  let Some(activity) = registry.get(&task.activity_name) else {
    warn!("activity_not_registered");
    let error =
      ActivityError::non_retryable(format!("unknown activity '{}'", task.activity_name));
    report(&client, &config, &task.task_id, Err(error)).await;
    return;
  };

  let ctx = ActivityContext {
    task_id: task.task_id.clone(),
    instance_id: task.instance_id.clone(),
    step_index: task.step_index,
    activity_name: task.activity_name.clone(),
    attempt: task.attempt,
    idempotency_key: task.idempotency_key.clone(),
  };

  debug!(delivery = task.deliveries, "activity_started");
  let work = activity.execute(ctx, task.input.clone());
  tokio::pin!(work);

  let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
  // The first tick completes immediately; the lease is fresh.
  heartbeat.tick().await;

  let result = loop {
    tokio::select! {
      result = &mut work => break result,
      _ = heartbeat.tick() => {
        if let Err(e) = client.heartbeat(&task.task_id, config.lease).await {
          warn!(error = %e, "activity_heartbeat_failed");
        }
      }
    }
  };

  match &result {
    Ok(_) => info!("activity_succeeded"),
    Err(e) => warn!(error = %e, non_retryable = e.non_retryable, "activity_failed"),
  }
  report(&client, &config, &task.task_id, result).await;
}

/// Report an outcome, retrying transient client errors.
async fn report(
  client: &Arc<dyn WorkerClient>,
  config: &WorkerConfig,
  task_id: &str,
  result: Result<Value, ActivityError>,
) {
  let mut attempt = 1;
  loop {
    let reported = match &result {
      Ok(output) => client.complete(task_id, output.clone()).await,
      Err(error) => client.fail(task_id, error).await,
    };

    match reported {
      Ok(()) => return,
      Err(WorkerError::LeaseLost { reason, .. }) => {
        info!(task_id = %task_id, reason = %reason, "activity_result_discarded");
        return;
      }
      Err(e) if config.backoff.should_retry(attempt) => {
        let delay = config.backoff.backoff(attempt);
        warn!(task_id = %task_id, error = %e, attempt, "activity_report_failed");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => {
        // The lease will lapse and the task will be delivered again.
        error!(task_id = %task_id, error = %e, "activity_report_abandoned");
        return;
      }
    }
  }
}
