use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

/// Context provided to an activity for one delivery of a task.
#[derive(Debug, Clone)]
pub struct ActivityContext {
  pub task_id: String,
  pub instance_id: String,
  pub step_index: u32,
  pub activity_name: String,
  /// Attempt number of the step, starting at 1.
  pub attempt: u32,
  /// Stable for this attempt across redeliveries. Activities with external
  /// side effects can use it to deduplicate.
  pub idempotency_key: String,
}

/// Failure reported by an activity.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ActivityError {
  pub message: String,
  /// Skip any remaining retry budget and fail the step now.
  pub non_retryable: bool,
}

impl ActivityError {
  /// A failure that may succeed on a later attempt.
  pub fn retryable(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      non_retryable: false,
    }
  }

  /// A failure that will not go away on retry.
  pub fn non_retryable(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      non_retryable: true,
    }
  }
}

impl From<serde_json::Error> for ActivityError {
  fn from(e: serde_json::Error) -> Self {
    Self::non_retryable(format!("invalid activity input: {}", e))
  }
}

/// A unit of externally executed work, invoked by name.
///
/// Delivery is at-least-once, so implementations must tolerate running more
/// than once for the same `idempotency_key`.
#[async_trait]
pub trait Activity: Send + Sync {
  async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

type ActivityFn =
  dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync;

/// Adapts an async closure into an [`Activity`].
pub(crate) struct FnActivity {
  f: Box<ActivityFn>,
}

impl FnActivity {
  pub(crate) fn new<F, Fut>(f: F) -> Self
  where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
  {
    Self {
      f: Box::new(move |ctx, input| Box::pin(f(ctx, input))),
    }
  }
}

#[async_trait]
impl Activity for FnActivity {
  async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
    (self.f)(ctx, input).await
  }
}
