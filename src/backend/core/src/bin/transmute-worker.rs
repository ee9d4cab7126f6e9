//! Transmute Worker - standalone worker pool.
//!
//! Claims jobs from the shared Redis queue. Requires `TRANSMUTE__REDIS__URL`.

use anyhow::Context;
use clap::Parser;

use transmute_core::{config::Config, engine::Engine, observability};

#[derive(Parser, Debug)]
#[command(name = "transmute-worker", version, about = "Transmute conversion worker")]
struct Args {
    /// Configuration file; environment variables override it
    #[arg(short, long, env = "TRANSMUTE_CONFIG")]
    config: Option<String>,

    /// Concurrent worker slots
    #[arg(long)]
    concurrency: Option<usize>,

    /// Jobs a worker handles before it is replaced
    #[arg(long)]
    max_jobs_per_worker: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(max_jobs) = args.max_jobs_per_worker {
        config.worker.max_jobs_per_worker = max_jobs;
    }
    config.validate()?;

    observability::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Transmute Worker");

    let engine = Engine::connect(config).await?;
    engine.require_distributed()?;

    let pool = engine.start_workers();
    tracing::info!(
        concurrency = engine.config().worker.concurrency,
        max_jobs_per_worker = engine.config().worker.max_jobs_per_worker,
        "Worker pool running"
    );

    wait_for_signal().await;

    let stats = pool.stats().clone();
    pool.shutdown(engine.config().worker.shutdown_timeout).await;
    tracing::info!(
        processed = stats.processed(),
        succeeded = stats.succeeded(),
        failed = stats.failed(),
        retried = stats.retried(),
        "Worker shutdown complete"
    );

    observability::shutdown();
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
}
