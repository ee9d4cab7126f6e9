//! Transmute Server - Main entry point
//!
//! Serves the HTTP API. With `server.embedded_workers` set (the default) it also
//! runs a worker pool in-process.

use std::net::SocketAddr;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use transmute_core::{
    api::{self, AppState},
    config::Config,
    engine::Engine,
    observability,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match std::env::var("TRANSMUTE_CONFIG") {
        Ok(path) => Config::from_file(&path),
        Err(_) => Config::load(),
    }
    .context("Failed to load configuration")?;

    observability::init(&config.observability)?;
    let metrics = observability::metrics::install_prometheus()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Transmute Server");

    let engine = Engine::connect(config).await?;
    let shutdown = CancellationToken::new();
    let maintenance = engine.spawn_maintenance(shutdown.clone());

    let workers = if engine.config().server.embedded_workers {
        Some(engine.start_workers())
    } else {
        if !engine.is_distributed() {
            tracing::warn!(
                "Embedded workers are disabled and no Redis URL is set; submitted jobs will never run"
            );
        }
        None
    };

    let server = &engine.config().server;
    let ip: std::net::IpAddr = server
        .host
        .parse()
        .with_context(|| format!("Invalid server.host '{}'", server.host))?;
    let addr = SocketAddr::new(ip, server.port);
    let shutdown_timeout = engine.config().worker.shutdown_timeout;

    let app = api::build_router(AppState::new(engine.clone()).with_metrics(metrics));

    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    if let Some(workers) = workers {
        workers.shutdown(shutdown_timeout).await;
    }
    shutdown.cancel();
    if let Some(task) = maintenance {
        let _ = task.await;
    }
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
