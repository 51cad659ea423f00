//! sandpit-daemon - HTTP execution service for the JavaScript playground
//!
//! The same binary runs as the supervisor (default) and as a sandbox worker
//! (`--worker`). The supervisor owns the HTTP server and a pool of worker
//! processes it kills and respawns when a run overstays its deadline.

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::stream::StreamExt;
use sandpit_core::challenge::ChallengeCatalog;
use sandpit_core::collab::{EntryStore, MemoryEntryStore, MemoryProgressStore, ProgressStore};
use sandpit_core::worker::{self, WorkerCommand};
use sandpit_core::Engine;
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod pool;
mod server;

use config::{DaemonConfig, IsolationMode};
use pool::{Executor, WorkerPool};

#[derive(Parser)]
#[command(name = "sandpit-daemon")]
#[command(author, version, about = "Sandboxed JavaScript execution service")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SANDPIT_CONFIG")]
    config: Option<PathBuf>,

    /// Run as a sandbox worker speaking frames on stdin/stdout
    #[arg(long, hide = true)]
    worker: bool,
}

fn init_logging() -> Result<()> {
    // stdout belongs to the frame protocol in worker mode
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sandpit=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    if args.worker {
        let config = worker::config_from_env()?;
        return worker::worker_main(config).context("worker loop failed");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    tracing::info!("sandpit-daemon starting");

    let config = DaemonConfig::load(args.config.as_deref())?;
    tracing::info!(
        workers = config.num_workers,
        addr = %config.listen_addr,
        isolation = config.isolation.as_str(),
        "configuration loaded"
    );

    let catalog = match &config.challenges {
        Some(path) => ChallengeCatalog::load(path)
            .with_context(|| format!("loading challenges from {}", path.display()))?,
        None => ChallengeCatalog::default(),
    };
    if catalog.is_empty() {
        tracing::warn!("no challenges loaded, validation requests will return 404");
    } else {
        tracing::info!(challenges = catalog.len(), "challenge catalog loaded");
    }

    let executor = build_executor(&config).await?;

    let state = server::AppState::new(server::AppStateParts {
        executor,
        isolation: config.isolation,
        sandbox: config.sandbox.clone(),
        catalog,
        entries: Arc::new(MemoryEntryStore::bounded(config.max_contexts, config.entry_capacity))
            as Arc<dyn EntryStore>,
        progress: Arc::new(MemoryProgressStore::default()) as Arc<dyn ProgressStore>,
        concurrency: config.num_workers,
    })?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    let signals = Signals::new([SIGTERM, SIGINT, SIGQUIT])?;
    let handle = signals.handle();

    axum::serve(listener, server::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(signals))
        .await?;

    handle.close();
    let executor_state = state.clone();
    tokio::task::spawn_blocking(move || executor_state.executor().shutdown()).await?;
    tracing::info!("sandpit-daemon stopped");
    Ok(())
}

async fn build_executor(config: &DaemonConfig) -> Result<Executor> {
    match config.isolation {
        IsolationMode::Thread => Ok(Executor::Thread {
            engine: Engine::new(config.sandbox.clone()),
            slots: config.num_workers,
        }),
        IsolationMode::Process => {
            let command = WorkerCommand::current_exe()?;
            let config = config.clone();
            // spawning waits for each worker's ready frame
            let pool = tokio::task::spawn_blocking(move || {
                WorkerPool::new(
                    config.num_workers,
                    &command,
                    &config.sandbox,
                    config.recycle_after,
                    config.kill_grace,
                )
            })
            .await??;
            tracing::info!(workers = pool.status().total, "worker pool initialized");
            Ok(Executor::Process(pool))
        }
    }
}

async fn shutdown_signal(mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutdown signal received");
    }
}
