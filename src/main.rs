use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commandpool::config::{CommandPoolConfig, StoreBackend};
use commandpool::engine::DistributionEngine;
use commandpool::ingest;
use commandpool::service::CommandPool;
use commandpool::store::{MemoryStore, TokenStore};
use commandpool::sweeper::Sweeper;

#[derive(Parser)]
#[command(name = "commandpool", version, about = "Shared command distribution service")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sweeper, limiter reclaimers and ingestion feeds until shutdown
    Run,
    /// Ingest one crawl report and print the summary
    Ingest {
        /// Path of the JSON crawl report
        file: PathBuf,
    },
    /// Print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = CommandPoolConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Command::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        command => match config.store.backend {
            StoreBackend::Memory => {
                let store = MemoryStore::with_lock_timeout(config.store.lock_timeout());
                dispatch(command, Arc::new(store), config).await
            }
            StoreBackend::Postgres => run_postgres(command, config).await,
        },
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[cfg(feature = "postgres")]
async fn run_postgres(command: Command, config: CommandPoolConfig) -> anyhow::Result<()> {
    use commandpool::store::PgStore;

    let store = PgStore::connect(&config.store)
        .await
        .context("failed to connect to PostgreSQL")?;
    store.ensure_schema().await.context("failed to create schema")?;
    dispatch(command, Arc::new(store), config).await
}

#[cfg(not(feature = "postgres"))]
async fn run_postgres(_command: Command, _config: CommandPoolConfig) -> anyhow::Result<()> {
    anyhow::bail!("the postgres backend requires building with `--features postgres`")
}

async fn dispatch<S: TokenStore>(
    command: Command,
    store: Arc<S>,
    config: CommandPoolConfig,
) -> anyhow::Result<()> {
    match command {
        Command::Run => run(store, config).await,
        Command::Ingest { file } => {
            let engine = DistributionEngine::new(store, config.engine.clone());
            let summary = ingest::ingest_file(&engine, &file)
                .await
                .with_context(|| format!("failed to ingest {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::CheckConfig => Ok(()),
    }
}

async fn run<S: TokenStore>(store: Arc<S>, config: CommandPoolConfig) -> anyhow::Result<()> {
    info!("Starting Commandpool");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let pool = CommandPool::from_config(Arc::clone(&store), &config);
    let sweeper = Arc::new(Sweeper::new(store, config.sweeper.clone())?);
    if config.sweeper.daily_reset {
        info!(next = %sweeper.next_reset(), "Daily reset enabled");
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.extend(sweeper.spawn(cancel.clone()));
    tasks.extend(pool.limits().spawn_reclaimers(cancel.clone()));
    for feed in config.ingest.feeds.iter().cloned() {
        tasks.push(ingest::spawn_feed(
            Arc::clone(pool.engine()),
            feed,
            cancel.clone(),
        ));
    }
    tasks.push(spawn_stats_logger(
        Arc::clone(pool.engine()),
        Arc::clone(&sweeper),
        Duration::from_secs(config.runtime.stats_interval_secs),
        cancel.clone(),
    ));

    info!(tasks = tasks.len(), "Commandpool running");

    shutdown_signal().await;
    cancel.cancel();

    for result in futures::future::join_all(tasks).await {
        if let Err(err) = result {
            warn!(error = %err, "Background task ended abnormally");
        }
    }

    info!("Commandpool stopped");
    Ok(())
}

fn spawn_stats_logger<S: TokenStore>(
    engine: Arc<DistributionEngine<S>>,
    sweeper: Arc<Sweeper<S>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if every.is_zero() {
            return;
        }
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let stats = sweeper.stats();
                    match engine.available_count().await {
                        Ok(available) => info!(
                            available = available,
                            age_sweeps = stats.age_sweeps,
                            resets = stats.resets,
                            rows_deleted = stats.rows_deleted,
                            sweep_failures = stats.failures,
                            "Pool statistics"
                        ),
                        Err(err) => warn!(error = %err, "Failed to count available commands"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
