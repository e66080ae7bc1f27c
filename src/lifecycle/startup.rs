//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize logging and metrics before anything logs
//! - Start background tasks (sweeper, config reload, signals, admin API)
//! - Bind the ingestion listener last and serve until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Shutdown has a deadline: background tasks are abandoned after it

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::admin::serve_admin;
use crate::config::loader::{load_config, ConfigError};
use crate::config::watcher::ConfigWatcher;
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{reload_on_hangup, shutdown_on_signal};
use crate::observability::{logging, metrics};
use crate::security::maintenance::Sweeper;

/// How long background tasks get to finish after the server stops.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("failed to start metrics exporter on {address}: {reason}")]
    Metrics { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address).await.map_err(|source| StartupError::Bind {
        address: address.to_string(),
        source,
    })
}

/// Run the gateway from a config file until SIGINT or SIGTERM.
pub async fn run(config_path: &Path) -> Result<(), StartupError> {
    let config = load_config(config_path)?;

    logging::init_logging(&config.observability).map_err(|e| StartupError::Logging(e.to_string()))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        path = ?config_path,
        "webhook-gateway starting"
    );

    if config.observability.metrics_enabled {
        let address = config.observability.metrics_address.clone();
        let addr = address.parse().map_err(|e: std::net::AddrParseError| StartupError::Metrics {
            address: address.clone(),
            reason: e.to_string(),
        })?;
        metrics::init_metrics(addr).map_err(|e| StartupError::Metrics {
            address,
            reason: e.to_string(),
        })?;
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        store_backend = ?config.store.backend,
        rate_limit_enabled = config.rate_limit.enabled,
        replay_protection = config.security.enable_replay_protection,
        "Configuration loaded"
    );

    let shutdown = Arc::new(Shutdown::new());
    let server = HttpServer::new(config.clone());
    let state = server.state();

    let (watcher, config_updates) = ConfigWatcher::new(config_path);
    let reload_sender = watcher.sender();
    // Dropping the watcher stops file notifications.
    let _watch_guard = match watcher.run() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "Config file watching unavailable, SIGHUP reload only");
            None
        }
    };

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(shutdown_on_signal(shutdown.clone())));
    tasks.push(tokio::spawn(reload_on_hangup(
        PathBuf::from(config_path),
        reload_sender,
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(
        Sweeper::new(
            state.inner.clone(),
            Duration::from_secs(config.maintenance.sweep_interval_secs),
        )
        .run(shutdown.subscribe()),
    ));

    if config.admin.enabled {
        let admin_listener = bind(&config.admin.bind_address).await?;
        let admin_state = state.clone();
        let admin_shutdown = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve_admin(admin_listener, admin_state, admin_shutdown).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    let listener = bind(&config.listener.bind_address).await?;
    let result = server.run(listener, config_updates, shutdown.subscribe()).await;

    // The server can also stop on its own (listener error); take the rest down with it.
    shutdown.trigger();
    let signal_task = tasks.remove(0);
    signal_task.abort();
    let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            deadline_secs = DRAIN_DEADLINE.as_secs(),
            "Background tasks did not stop in time"
        );
    }

    result?;
    tracing::info!("Shutdown complete");
    Ok(())
}
