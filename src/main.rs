//! Domain-routed HTTP Load Balancer
//!
//! Main entry point for the balancer.
//! Responsibilities:
//! 1. Parse CLI arguments to load configuration.
//! 2. Build the upstream registry and bind the client-facing listener.
//! 3. Start the background tasks: health prober and operator control surface.
//! 4. Run the accept loop until `quit`, `Ctrl+C`, or `SIGTERM`, then drain.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hostlb::acceptor;
use hostlb::config::try_load_config;
use hostlb::control;
use hostlb::prober;
use hostlb::registry::Registry;
use hostlb::shutdown::ShutdownCoordinator;
use hostlb::upstream::BalancerError;

/// Command-line interface for the application.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// Main entry point: initialize logging, load config, start the tasks, and
/// handle shutdown.
#[tokio::main]
async fn main() -> Result<(), BalancerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Cli::parse();
    let config = try_load_config(&args.config)?.unwrap_or_default().finalize()?;

    // Finalize guarantees every section is present and valid.
    let server_cfg = config.server.clone().unwrap();
    let balancer_cfg = config.balancer.clone().unwrap();
    let bind_addr = server_cfg.bind_addr.unwrap();
    let probe_interval = balancer_cfg.health_check_interval_secs.unwrap();
    let probe_backoff = balancer_cfg.health_check_backoff_secs.unwrap();
    let shutdown_grace = Duration::from_secs(balancer_cfg.shutdown_grace_secs.unwrap());

    let registry = Arc::new(Registry::from_config(&config));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| BalancerError::Internal(format!("failed to bind {}: {}", bind_addr, e)))?;

    let mut coordinator = ShutdownCoordinator::new();

    let prober_registry = registry.clone();
    let prober_rx = coordinator.subscribe();
    coordinator
        .spawn_task(prober::probe_loop(prober_registry, probe_interval, probe_backoff, prober_rx));

    let control_registry = registry.clone();
    let control_handle = coordinator.handle();
    let control_rx = coordinator.subscribe();
    coordinator.spawn_task(control::control_loop(control_registry, control_handle, control_rx));

    let signal_handle = coordinator.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_handle.trigger();
    });

    info!(bind_addr = %bind_addr, probe_interval_secs = probe_interval, "Starting load balancer");
    info!("Commands: list, metrics, quit");

    acceptor::accept_loop(listener, registry, coordinator.subscribe()).await;

    info!("Gracefully shutting down background tasks.");
    if let Err(e) = coordinator.graceful_shutdown(shutdown_grace).await {
        error!("Graceful shutdown failed: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Resolves when the process receives `Ctrl+C` or, on Unix, `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, starting graceful shutdown.");
        },
        _ = terminate => {
            info!("SIGTERM received, starting graceful shutdown.");
        },
    }
}
