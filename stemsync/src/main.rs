//! stemsync - Audio stem separation service
//!
//! Splits uploaded songs into instrument stems, streams job progress over
//! SSE and serves the resulting WAV files from a content-addressed cache.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use stemsync::models::Mode;
use stemsync::services::command_backend::RunnerCommand;
use stemsync::services::separation_engine::SYNTHETIC_STEM_DELAY;
use stemsync::services::{
    CacheReaper, CommandEngineFactory, EngineFactory, EngineRegistry, ResultCache,
    SyntheticEngineFactory,
};
use stemsync::AppState;
use stemsync_common::config::{self, EngineBackendKind, RootFolderInitializer, RootFolderResolver};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for stemsync
#[derive(Parser, Debug)]
#[command(name = "stemsync")]
#[command(about = "Audio stem separation service")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "STEMSYNC_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "STEMSYNC_HOST")]
    host: Option<String>,

    /// Root folder holding the result cache and uploads
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Bootstrap configuration file
    #[arg(short, long, env = "STEMSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Separation backend: command or synthetic
    #[arg(long, env = "STEMSYNC_BACKEND")]
    backend: Option<String>,

    /// Program that runs the separation model
    #[arg(long, env = "STEMSYNC_RUNNER")]
    runner: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut toml_config = config::load_or_default(args.config.as_deref());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("stemsync={},tower_http=info", toml_config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stemsync (Stem Separation) service");
    info!(
        "Version: {} ({}, {} build {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE"),
        env!("BUILD_TIMESTAMP")
    );

    // CLI overrides
    if let Some(port) = args.port {
        toml_config.server.port = port;
    }
    if let Some(host) = args.host {
        toml_config.server.host = host;
    }
    if let Some(backend) = args.backend.as_deref() {
        toml_config.engine.backend = match backend.trim().to_ascii_lowercase().as_str() {
            "command" => EngineBackendKind::Command,
            "synthetic" => EngineBackendKind::Synthetic,
            other => bail!("Unknown backend '{}' (expected command or synthetic)", other),
        };
    }
    if let Some(runner) = args.runner {
        toml_config.engine.runner = runner;
    }

    // Step 1: Resolve root folder
    let root_folder = RootFolderResolver::new()
        .with_cli_arg(args.root_folder)
        .with_toml(toml_config.root_folder.clone())
        .resolve();

    // Step 2: Create root, outputs and uploads directories
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Root folder: {}", initializer.root_folder().display());

    // Step 3: Engine factory, chosen once for the process
    let factory: Arc<dyn EngineFactory> = match toml_config.engine.backend {
        EngineBackendKind::Command => {
            info!(
                runner = %toml_config.engine.runner,
                args = ?toml_config.engine.runner_args,
                "Using command separation backend"
            );
            Arc::new(CommandEngineFactory::new(
                RunnerCommand::new(
                    toml_config.engine.runner.clone(),
                    toml_config.engine.runner_args.clone(),
                ),
                initializer.root_folder().join("scratch"),
            ))
        }
        EngineBackendKind::Synthetic => {
            warn!("Synthetic backend selected: stems are fabricated and not cached");
            Arc::new(SyntheticEngineFactory::new(SYNTHETIC_STEM_DELAY))
        }
    };
    let registry = Arc::new(EngineRegistry::new(factory));
    let cache = ResultCache::new(initializer.outputs_dir());

    // Step 4: Preload engines in the background
    let preload: Vec<Mode> = toml_config
        .engine
        .preload
        .iter()
        .filter_map(|name| match name.parse::<Mode>() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!("Ignoring preload entry: {}", e);
                None
            }
        })
        .collect();
    if !preload.is_empty() {
        registry.spawn_preload(preload);
    }

    // Step 5: Cache reaper
    let reaper = CacheReaper::new(
        cache.clone(),
        initializer.uploads_dir(),
        Duration::from_secs(toml_config.cache.max_age_hours.saturating_mul(3600)),
    );
    reaper.spawn(Duration::from_secs(toml_config.cache.reap_interval_secs.max(1)));
    info!(
        max_age_hours = toml_config.cache.max_age_hours,
        interval_secs = toml_config.cache.reap_interval_secs,
        "Cache reaper started"
    );

    let host = toml_config.server.host.clone();
    let port = toml_config.server.port;

    let state = AppState::new(registry, cache, initializer.uploads_dir(), toml_config);
    let app = stemsync::build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
