use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use marigold_config::WorkflowDef;
use tokio::fs;
use tracing::{debug, info};

use crate::error::WorkflowError;
use crate::validate::validate;
use crate::workflow::Workflow;

/// In-memory registry of validated workflow definitions keyed by
/// `(name, version)`.
///
/// Definitions are immutable once registered. Registering the exact same
/// definition twice is a no-op; registering a different definition under an
/// existing key is rejected.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
  definitions: HashMap<(String, u32), Arc<Workflow>>,
}

impl DefinitionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Validate and register a definition.
  pub fn register(&mut self, def: WorkflowDef) -> Result<Arc<Workflow>, WorkflowError> {
    let workflow = validate(&def)?;
    let key = (workflow.name.clone(), workflow.version);

    if let Some(existing) = self.definitions.get(&key) {
      if **existing == workflow {
        return Ok(existing.clone());
      }
      return Err(WorkflowError::AlreadyRegistered {
        name: key.0,
        version: key.1,
      });
    }

    debug!(name = %workflow.name, version = workflow.version, "definition_registered");
    let workflow = Arc::new(workflow);
    self.definitions.insert(key, workflow.clone());
    Ok(workflow)
  }

  /// Look up a definition by name and version.
  pub fn lookup(&self, name: &str, version: u32) -> Result<Arc<Workflow>, WorkflowError> {
    self
      .definitions
      .get(&(name.to_string(), version))
      .cloned()
      .ok_or_else(|| WorkflowError::NotFound {
        name: name.to_string(),
        version,
      })
  }

  /// Load every `*.json` definition in a directory.
  ///
  /// Returns the number of definitions registered. A missing directory is
  /// treated as empty.
  pub async fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, WorkflowError> {
    let dir = dir.as_ref();
    if !dir.exists() {
      return Ok(0);
    }

    let load_err = |path: &Path, message: String| WorkflowError::Load {
      path: path.display().to_string(),
      message,
    };

    let mut entries = fs::read_dir(dir)
      .await
      .map_err(|e| load_err(dir, e.to_string()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
      .next_entry()
      .await
      .map_err(|e| load_err(dir, e.to_string()))?
    {
      let path = entry.path();
      if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
        paths.push(path);
      }
    }
    // Deterministic registration order so conflicts are reported consistently.
    paths.sort();

    for path in &paths {
      let content = fs::read_to_string(path)
        .await
        .map_err(|e| load_err(path, e.to_string()))?;
      let def = WorkflowDef::from_json(&content).map_err(|e| load_err(path, e.to_string()))?;
      self.register(def)?;
    }

    info!(dir = %dir.display(), count = paths.len(), "definitions_loaded");
    Ok(paths.len())
  }

  /// All registered `(name, version)` pairs, sorted.
  pub fn keys(&self) -> Vec<(String, u32)> {
    let mut keys: Vec<_> = self.definitions.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.definitions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.definitions.is_empty()
  }
}
