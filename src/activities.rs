//! Built-in demo activities served by `marigold serve`.

use async_trait::async_trait;
use marigold_worker::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use serde_json::{Value, json};
use tracing::info;

/// Builds a display name from `firstname` and `lastname`.
struct CreateUser;

#[async_trait]
impl Activity for CreateUser {
  async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
    let field = |name: &str| {
      input[name]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ActivityError::non_retryable(format!("missing input '{}'", name)))
    };
    let user = format!("{} {}", field("firstname")?, field("lastname")?);

    info!(
      instance_id = %ctx.instance_id,
      idempotency_key = %ctx.idempotency_key,
      user = %user,
      "user_created"
    );
    Ok(json!(user))
  }
}

pub fn registry() -> ActivityRegistry {
  let mut registry = ActivityRegistry::new();
  registry.register("create_user", CreateUser);
  registry.register_fn("echo", |_ctx, input| async move { Ok(input) });
  registry
}
