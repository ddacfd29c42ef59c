//! `rusty-automation-tool` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a workflow definition JSON file.
//! - `migrate`  — run pending database migrations.
//! - `reap`     — apply a timeout policy to every expired wait state once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cache::{ContextCache, DistributedLock, FastStore, RedisConfig, RedisStore};
use db::{ExecutionStore, PgExecutionStore};
use engine::{
    EngineConfig, ExecutorRegistry, TimeoutPolicy, WaitEventsNode, WaitStateService,
    WorkflowDefinition, WorkflowEngine,
};
use nodes::{NodeExecutor, TriggerNode};

#[derive(Parser)]
#[command(
    name = "rusty-automation-tool",
    about = "Distributed workflow execution engine",
    version
)]
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
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Sweep expired wait states once.
    Reap {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// fail | continue | continue_with_partial
        #[arg(long, default_value = "fail")]
        policy: TimeoutPolicy,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Migrate { database_url } => {
            info!("running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("migrations applied successfully");
            Ok(())
        }
        Command::Reap {
            database_url,
            policy,
        } => reap(&database_url, policy).await,
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&content).context("invalid JSON")?;

    let order = WorkflowDefinition::from_value(raw).and_then(|def| engine::validate_dag(&def));
    match order {
        Ok(order) => {
            println!("Workflow is valid. Execution order: {order:?}");
            Ok(())
        }
        Err(e) => {
            eprintln!("Validation failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn reap(database_url: &str, policy: TimeoutPolicy) -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let pool = db::pool::create_pool(database_url, 4)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn ExecutionStore> = Arc::new(PgExecutionStore::new(pool));
    let fast: Arc<dyn FastStore> = Arc::new(
        RedisStore::connect(&RedisConfig::from_env())
            .await
            .context("failed to connect to redis")?,
    );

    let executors: Vec<Arc<dyn NodeExecutor>> = vec![
        Arc::new(TriggerNode),
        Arc::new(WaitEventsNode::new(Arc::clone(&store))),
    ];
    let engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&store),
        Arc::new(ExecutorRegistry::from_executors(executors)),
        Arc::new(DistributedLock::new(Arc::clone(&fast), config.instance_id.clone())),
        Arc::new(ContextCache::new(fast, config.context_ttl)),
        config,
    ));
    let service = WaitStateService::new(store, engine);

    let expired = service.expired(Utc::now()).await?;
    info!("{} expired wait state(s), policy {:?}", expired.len(), policy);
    for ws in expired {
        match service.expire(ws.execution_id, &ws.node_id, policy).await {
            Ok(Some(outcome)) => info!(
                "wait state {} of execution {}: {:?}",
                ws.id, ws.execution_id, outcome
            ),
            Ok(None) => info!("wait state {} already handled", ws.id),
            Err(e) => warn!("could not expire wait state {}: {}", ws.id, e),
        }
    }
    Ok(())
}
