use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use harvest_core::HarvestConfig;
use harvest_scheduler::SchedulerService;
use harvest_scripts::{ScriptRegistry, ShellScript};
use harvest_store::{ExecutionStore, TaskStore};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "harvestd=info,harvest_scheduler=info,harvest_store=info,harvest_scripts=info"
                    .into()
            }),
        )
        .init();

    let args = Cli::parse();

    // config: --config flag > HARVEST_CONFIG env > ~/.harvest/harvest.toml
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("HARVEST_CONFIG").ok());
    let config = HarvestConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        HarvestConfig::default()
    });

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::InitDb => cli::init_schema(&config),
        Command::Task(command) => cli::task_command(command, &config),
        Command::Executions {
            task,
            status,
            limit,
            offset,
        } => cli::show_executions(&config, task, status, limit, offset),
        Command::Stats { task } => cli::show_stats(&config, task),
    }
}

async fn run_daemon(config: HarvestConfig) -> anyhow::Result<()> {
    let service = build_service(&config)?;
    service.start()?;

    let health = service.scheduler_health();
    info!(
        armed = health.active_job_count,
        "harvest daemon running; press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down");
    service.stop().await;
    Ok(())
}

/// Open the database, run migrations, and wire the scheduler service.
///
/// Each store gets its own connection so the fire loop and management
/// callers never contend on a single handle.
pub(crate) fn build_service(config: &HarvestConfig) -> anyhow::Result<SchedulerService> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=3000;")?;
    harvest_store::db::init_db(&db)?;
    let tasks = Arc::new(TaskStore::new(db));

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA busy_timeout=3000;")?;
    let executions = Arc::new(ExecutionStore::new(db));

    let registry = build_registry(config);
    Ok(SchedulerService::new(tasks, executions, registry, config))
}

/// Turn every `[[script]]` config entry into a registered shell script.
fn build_registry(config: &HarvestConfig) -> Arc<ScriptRegistry> {
    let registry = Arc::new(ScriptRegistry::new());
    for entry in &config.scripts {
        registry.register(Arc::new(ShellScript::from_config(entry)));
    }
    info!(scripts = registry.ids().len(), "script registry ready");
    registry
}

/// Ensure the parent directory for a file path exists.
pub(crate) fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
