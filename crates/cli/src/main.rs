//! `flowrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate a workflow JSON file.
//! - `run`: run a workflow once and print its execution trace.
//! - `migrate`: run pending database migrations.
//! - `recover`: resume executions interrupted by a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use engine::{EngineConfig, Workflow, WorkflowExecutor};
use instructions::{InstructionRegistry, ReqwestTransport};
use store::{ExecutionStatus, MemoryStore, PgStore, Store};

#[derive(Parser)]
#[command(name = "flowrun", about = "Workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run a workflow once, manually triggered, and print the result.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Trigger payload as inline JSON.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Persist to Postgres instead of keeping the run in memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[command(flatten)]
        tuning: EngineArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Settle interrupted jobs and resume unfinished executions.
    Recover {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[command(flatten)]
        tuning: EngineArgs,
    },
}

#[derive(Args)]
struct EngineArgs {
    #[arg(long, env = "FLOWRUN_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    /// Base back-off between retries, in milliseconds.
    #[arg(long, env = "FLOWRUN_RETRY_DELAY_MS", default_value_t = 100)]
    retry_delay_ms: u64,
    #[arg(long, env = "FLOWRUN_MAX_STEPS", default_value_t = 1000)]
    max_steps: usize,
    #[arg(long, env = "FLOWRUN_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_delay_ms),
            max_steps: self.max_steps,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let workflow = read_workflow(&path)?;
            let registry = builtins();

            match engine::validate_graph(&workflow, &registry) {
                Ok(entry) => {
                    println!("✅ Workflow is valid. Entry node: {entry}");
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, payload, database_url, tuning } => {
            let workflow = read_workflow(&path)?;
            let payload: Value = serde_json::from_str(&payload).context("--payload is not valid JSON")?;

            let store: Arc<dyn Store> = match database_url {
                Some(url) => Arc::new(connect(&url, tuning.max_connections).await?),
                None => Arc::new(MemoryStore::new()),
            };
            let executor = WorkflowExecutor::new(store, builtins(), tuning.config());

            executor.save_workflow(&workflow).await?;
            let execution_id = executor.start_execution(workflow.id, payload).await?;
            let status = report(&executor, execution_id).await?;
            if status != ExecutionStatus::Resolved {
                bail!("execution {execution_id} ended {status}");
            }
        }
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = store::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            store::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
        Command::Recover { database_url, tuning } => {
            let store = Arc::new(connect(&database_url, tuning.max_connections).await?);
            let unfinished = store.list_unfinished_executions().await?;
            let executor = WorkflowExecutor::new(store, builtins(), tuning.config());

            let count = executor.recover().await?;
            info!(count, "recovering executions");
            for row in unfinished {
                report(&executor, row.id).await?;
            }
        }
    }

    Ok(())
}

fn builtins() -> InstructionRegistry {
    InstructionRegistry::with_builtins(Arc::new(ReqwestTransport::new()))
}

fn read_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).context("invalid workflow JSON")
}

async fn connect(database_url: &str, max_connections: u32) -> Result<PgStore> {
    let pool = store::pool::create_pool(database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    Ok(PgStore::new(pool))
}

/// Wait for the execution to finish and print it with its jobs.
async fn report(executor: &WorkflowExecutor, execution_id: uuid::Uuid) -> Result<ExecutionStatus> {
    let execution = executor.wait_until_finished(execution_id).await?;
    let jobs = executor.jobs(execution_id).await?;
    let trace = json!({ "execution": execution, "jobs": jobs });
    println!("{}", serde_json::to_string_pretty(&trace)?);
    Ok(execution.status)
}
