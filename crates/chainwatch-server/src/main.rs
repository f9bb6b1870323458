//! Chainwatch server binary.
//!
//! Migrates and bootstraps the chain database, starts the retention task,
//! and serves the watch API with graceful shutdown on SIGTERM/SIGINT.
//! Any startup failure exits with status 1; a half-bootstrapped chain set
//! is never served.

use chainwatch_db::{
    bootstrap_resources, create_pool, create_read_pool, run_migrations, BootstrapError,
    MigrationError, PoolError, PoolSettings,
};
use chainwatch_server::config::{self, Config, ConfigError};
use chainwatch_server::retention::start_retention_task;
use chainwatch_server::{app, unix_now, AppState, WatchSettings};
use chainwatch_types::ResourceRegistry;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum StartupError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to get a database connection: {0}")]
    Connection(#[from] r2d2::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("CHAINWATCH_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("chainwatch.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chainwatch-server: {}", StartupError::from(e));
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "chainwatch server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    // Bootstrap and the retention task are the only writers.
    let pool = create_pool(
        &config.database.path,
        PoolSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: 2,
        },
    )?;
    let registry = Arc::new(ResourceRegistry::with_types(&config.watch.resources));

    {
        let conn = pool.get()?;
        let applied = run_migrations(&conn)?;
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
        bootstrap_resources(&conn, &registry, unix_now())?;
    }

    let read_pool = create_read_pool(
        &config.database.path,
        PoolSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )?;

    let cancel = CancellationToken::new();
    let retention = tokio::spawn(start_retention_task(
        pool,
        config.retention.interval_secs,
        cancel.clone(),
    ));

    let state = AppState {
        pool: read_pool,
        registry,
        watch: WatchSettings::from(&config.watch),
    };
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, resources = state.registry.len(), "starting chainwatch server");

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    if let Err(e) = retention.await {
        tracing::warn!(error = %e, "retention task did not stop cleanly");
    }
    served?;

    tracing::info!("chainwatch server shut down");
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
