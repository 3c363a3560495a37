use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use harvest_core::HarvestConfig;
use harvest_jobs::{run_retention, Dispatcher, JobType, NewJob, Runner, SqliteJobStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cli;
mod executor;

use cli::{Cli, Commands};
use executor::CommandExecutor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvest_worker=info,harvest_jobs=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > HARVEST_CONFIG env > ~/.harvest/harvest.toml
    let config_path = cli.config.or_else(|| std::env::var("HARVEST_CONFIG").ok());
    let config = HarvestConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        HarvestConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = SqliteJobStore::open(db_path, config.runner.worker_id.clone())
        .with_context(|| format!("opening job store at {db_path}"))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, store).await,
        Commands::Enqueue {
            job_type,
            url,
            priority,
            input,
        } => enqueue(&store, job_type, url, priority, input).await,
        Commands::Cleanup => {
            let stats = run_retention(&store, &config.retention, Utc::now()).await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Status => {
            let counts = store.count_by_status().await?;
            let documents = store.count_documents().await?;
            let report = serde_json::json!({ "jobs": counts, "documents": documents });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn run(config: HarvestConfig, store: SqliteJobStore) -> anyhow::Result<()> {
    config.validate()?;
    let dispatcher = build_dispatcher(&config)?;
    if dispatcher.is_empty() {
        warn!("no executors configured; every claimed job will fail as UNKNOWN_JOB_TYPE");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!(
        worker_id = %config.runner.worker_id,
        max_concurrent = config.runner.max_concurrent_jobs(),
        job_types = ?dispatcher.registered_types(),
        "harvest worker started"
    );

    let grace = config.runner.shutdown_grace();
    let mut runner = Runner::new(
        Arc::new(store),
        dispatcher,
        config.runner,
        config.retention,
        shutdown,
    );
    runner.run().await;

    if runner.drain(grace).await {
        info!("all executions finished");
    } else {
        warn!(
            still_running = runner.running(),
            grace_secs = grace.as_secs(),
            "shutdown grace elapsed with executions in flight"
        );
    }
    Ok(())
}

/// One [`CommandExecutor`] per `[executors.<type>]` table.
fn build_dispatcher(config: &HarvestConfig) -> anyhow::Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new();
    for (tag, executor) in &config.executors {
        let job_type = JobType::from(tag.as_str());
        if !job_type.is_builtin() {
            warn!(%job_type, "registering executor for non-builtin job type");
        }
        dispatcher
            .register(job_type, Arc::new(CommandExecutor::new(executor.clone())))
            .with_context(|| format!("executor for job type {tag}"))?;
    }
    Ok(dispatcher)
}

async fn enqueue(
    store: &SqliteJobStore,
    job_type: String,
    url: String,
    priority: i64,
    input: Option<String>,
) -> anyhow::Result<()> {
    let job_type = JobType::from(job_type);
    if !job_type.is_well_formed() {
        bail!("invalid job type '{job_type}': use lowercase letters, digits, '_' or '-'");
    }
    let mut new = NewJob::new(job_type, url).with_priority(priority);
    if let Some(raw) = input {
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("--input must be valid JSON")?;
        new = new.with_input(value);
    }
    let job = store.insert_job(new).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

/// Cancel `token` on Ctrl-C or, on Unix, SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
    token.cancel();
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
