//! backupd - Background backup daemon
//!
//! Mirrors local directories to remote backends:
//! - Opens one cache per backend, bootstrapping empty ones from the remote
//! - Runs one dispatch loop per backend
//! - Watches every source directory for changes
//! - Scans sources at startup for changes made while it was not running
//! - Shuts down gracefully on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! All long-running tasks share one `CancellationToken`, triggered on
//! receipt of SIGTERM or SIGINT.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use backupd_core::config::{Config, CONFIG_FILE_NAME};
use backupd_sync::walker::walk;
use backupd_sync::watcher::{forward, FileWatcher};
use backupd_sync::{connect, Connection, ServiceRegistry};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command line of the daemon
#[derive(Debug, Parser)]
#[command(name = "backupd", version, about = "Back up local directories to remote storage")]
struct Cli {
    /// Directory holding backupd.yml
    #[arg(short = 'c', long)]
    config_dir: Option<PathBuf>,

    /// Directory holding the caches
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Loads and validates `<config_dir>/backupd.yml`
fn load_config(config_dir: &Path) -> Result<Config> {
    let path = config_dir.join(CONFIG_FILE_NAME);
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let problems = config.validate();
    if !problems.is_empty() {
        let details: Vec<String> = problems.iter().map(ToString::to_string).collect();
        anyhow::bail!(
            "Invalid configuration in {}:\n  {}",
            path.display(),
            details.join("\n  ")
        );
    }

    Ok(config)
}

/// `RUST_LOG` wins over the configured level
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

// ============================================================================
// DaemonService
// ============================================================================

/// Running engine: backends, destinations and their tasks
struct DaemonService {
    connection: Connection,
    shutdown: CancellationToken,
}

impl DaemonService {
    async fn new(config: &Config, config_dir: &Path, data_dir: &Path, shutdown: CancellationToken) -> Result<Self> {
        let connection = connect(config, config_dir, data_dir, &ServiceRegistry::with_defaults())
            .await
            .context("Failed to connect backends")?;
        Ok(Self { connection, shutdown })
    }

    /// Runs until the shutdown token is cancelled
    async fn run(&self) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for backend in self.connection.backends.values() {
            let backend = Arc::clone(backend);
            let token = self.shutdown.clone();
            tasks.push(tokio::spawn(async move { backend.run(token).await }));
        }

        // Dropping the watcher stops all watches
        let (mut watcher, events) = FileWatcher::new()?;
        for destination in &self.connection.destinations {
            if let Err(e) = watcher.watch(destination.local_root()) {
                warn!(
                    path = %destination.local_root().display(),
                    error = %format!("{e:#}"),
                    "Source not watched; only the startup scan will cover it"
                );
            }
        }
        tasks.push(tokio::spawn(forward(
            events,
            self.connection.destinations.clone(),
            self.shutdown.clone(),
        )));

        let destinations = self.connection.destinations.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            for destination in &destinations {
                walk(destination, &token).await;
            }
        }));

        info!(
            backends = self.connection.backends.len(),
            sources = self.connection.destinations.len(),
            "backupd running"
        );

        self.shutdown.cancelled().await;
        drop(watcher);

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Task ended abnormally");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(Config::default_config_dir);
    let data_dir = cli.data_dir.unwrap_or_else(Config::default_data_dir);

    let config = load_config(&config_dir)?;

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&config.logging.level))
        .with_target(true)
        .init();

    info!(
        config_dir = %config_dir.display(),
        data_dir = %data_dir.display(),
        "backupd starting"
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(&config, &config_dir, &data_dir, shutdown_token.clone()).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("backupd shut down gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "backupd exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
