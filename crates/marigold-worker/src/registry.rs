use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::{Activity, ActivityContext, ActivityError, FnActivity};

/// Activities available to a worker pool, keyed by activity name.
///
/// Populated at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
  activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an activity. Replaces any activity already registered under
  /// `name`.
  pub fn register(&mut self, name: impl Into<String>, activity: impl Activity + 'static) {
    self.activities.insert(name.into(), Arc::new(activity));
  }

  /// Register an async closure as an activity.
  pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
  where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
  {
    self.register(name, FnActivity::new(f));
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
    self.activities.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.activities.contains_key(name)
  }

  /// Registered activity names, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<_> = self.activities.keys().map(String::as_str).collect();
    names.sort();
    names
  }
}
