mod activities;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marigold_config::EngineConfig;
use marigold_engine::{Engine, EngineRunner};
use marigold_queue::SqliteQueue;
use marigold_store::{SqliteStore, connect};
use marigold_worker::{WorkerConfig, WorkerPool};
use marigold_workflow::DefinitionRegistry;

/// Marigold - a durable workflow engine
#[derive(Parser)]
#[command(name = "marigold")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.marigold)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Engine configuration file (default: <data-dir>/config.json if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the engine timers and a worker pool until interrupted
  Serve {
    /// Queues to poll (default: the engine queue)
    #[arg(long = "queue")]
    queues: Vec<String>,
  },

  /// Start a workflow instance; the input is read from stdin as JSON
  Start {
    /// Definition name
    name: String,

    /// Definition version
    #[arg(long, default_value_t = 1)]
    version: u32,

    /// Repeated starts with the same key return the same instance
    #[arg(long)]
    idempotency_key: Option<String>,
  },

  /// Send a signal to a waiting instance; the payload is read from stdin as JSON
  Signal {
    instance_id: String,
    signal_name: String,
  },

  /// Print an instance and its history as JSON
  Show { instance_id: String },

  /// Cancel an instance
  Cancel {
    instance_id: String,

    #[arg(long)]
    reason: Option<String>,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".marigold"),
  };

  let Some(command) = cli.command else {
    println!("marigold - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run(command, data_dir, cli.config).await })
}

async fn run(command: Commands, data_dir: PathBuf, config: Option<PathBuf>) -> Result<()> {
  let engine = Arc::new(open_engine(&data_dir, config).await?);

  match command {
    Commands::Serve { queues } => serve(engine, queues).await,
    Commands::Start {
      name,
      version,
      idempotency_key,
    } => {
      let input = read_payload_from_stdin()?;
      let instance_id = engine
        .start_workflow(&name, version, input, idempotency_key)
        .await
        .with_context(|| format!("failed to start workflow {}@{}", name, version))?;
      println!("{}", instance_id);
      Ok(())
    }
    Commands::Signal {
      instance_id,
      signal_name,
    } => {
      let payload = read_payload_from_stdin()?;
      let instance = engine
        .signal_workflow(&instance_id, &signal_name, payload)
        .await
        .with_context(|| format!("failed to signal instance {}", instance_id))?;
      println!("{}", serde_json::to_string_pretty(&instance)?);
      Ok(())
    }
    Commands::Show { instance_id } => {
      let view = engine
        .get_workflow(&instance_id)
        .await
        .with_context(|| format!("failed to load instance {}", instance_id))?;
      println!("{}", serde_json::to_string_pretty(&view)?);
      Ok(())
    }
    Commands::Cancel {
      instance_id,
      reason,
    } => {
      let instance = engine
        .cancel_workflow(&instance_id, reason)
        .await
        .with_context(|| format!("failed to cancel instance {}", instance_id))?;
      println!("{}", serde_json::to_string_pretty(&instance)?);
      Ok(())
    }
  }
}

/// Open the SQLite-backed engine rooted at `data_dir`.
async fn open_engine(data_dir: &Path, config: Option<PathBuf>) -> Result<Engine> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

  let config = load_config(data_dir, config)?;

  let mut definitions = DefinitionRegistry::new();
  let definitions_dir = data_dir.join("definitions");
  definitions
    .load_dir(&definitions_dir)
    .await
    .with_context(|| {
      format!(
        "failed to load definitions from {}",
        definitions_dir.display()
      )
    })?;

  let db_path = data_dir.join("marigold.db");
  let pool = connect(&format!("sqlite://{}", db_path.display()))
    .await
    .with_context(|| format!("failed to open database: {}", db_path.display()))?;

  let store = SqliteStore::new(pool.clone());
  store
    .migrate()
    .await
    .context("failed to migrate instance store")?;
  let queue = SqliteQueue::new(pool);
  queue.migrate().await.context("failed to migrate task queue")?;

  Ok(Engine::new(
    Arc::new(store),
    Arc::new(queue),
    Arc::new(definitions),
    config,
  ))
}

fn load_config(data_dir: &Path, config: Option<PathBuf>) -> Result<EngineConfig> {
  let path = match config {
    Some(path) => path,
    None => {
      let default = data_dir.join("config.json");
      if !default.exists() {
        return Ok(EngineConfig::default());
      }
      default
    }
  };
  EngineConfig::from_file(&path)
    .with_context(|| format!("failed to load config: {}", path.display()))
}

async fn serve(engine: Arc<Engine>, queues: Vec<String>) -> Result<()> {
  let mut worker_config = WorkerConfig::from_engine_config(engine.config());
  if !queues.is_empty() {
    worker_config = worker_config.with_queues(queues);
  }

  let registry = activities::registry();
  info!(
    definitions = engine.executor().definitions().len(),
    activities = ?registry.names(),
    queues = ?worker_config.queues,
    "marigold_serving"
  );

  let cancel = CancellationToken::new();
  let runner = tokio::spawn(EngineRunner::new(engine.clone()).start(cancel.clone()));
  let pool = WorkerPool::new(engine, Arc::new(registry), worker_config);
  let workers = {
    let cancel = cancel.clone();
    tokio::spawn(async move { pool.run(cancel).await })
  };

  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for ctrl-c")?;
  info!("shutdown_requested");
  cancel.cancel();

  workers.await.context("worker pool panicked")?;
  runner.await.context("engine runner panicked")?;
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read payload from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
    }
  }
}
