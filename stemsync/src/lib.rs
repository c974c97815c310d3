//! stemsync library interface
//!
//! Audio stem separation service: content-addressed result cache, per-mode
//! engine singletons and streamed job progress over HTTP.

pub mod api;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use services::{EngineRegistry, JobOrchestrator, ResultCache};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stemsync_common::config::TomlConfig;
use sysinfo::System;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Job driver (owns the engine registry and cache handles)
    pub orchestrator: Arc<JobOrchestrator>,
    /// Per-mode engine singletons
    pub registry: Arc<EngineRegistry>,
    /// Persisted separation results
    pub cache: ResultCache,
    /// Scratch area for uploads
    pub uploads_dir: PathBuf,
    /// Bootstrap configuration
    pub config: Arc<TomlConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Resource sampler for /api/model-status
    pub system: Arc<Mutex<System>>,
    /// Last job failure for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        registry: Arc<EngineRegistry>,
        cache: ResultCache,
        uploads_dir: PathBuf,
        config: TomlConfig,
    ) -> Self {
        let last_error = Arc::new(RwLock::new(None));
        let orchestrator = JobOrchestrator::new(Arc::clone(&registry), cache.clone(), uploads_dir.clone())
            .with_keepalive(Duration::from_millis(config.engine.keepalive_ms.max(1)))
            .with_last_error(Arc::clone(&last_error));

        Self {
            orchestrator: Arc::new(orchestrator),
            registry,
            cache,
            uploads_dir,
            config: Arc::new(config),
            startup_time: Utc::now(),
            system: Arc::new(Mutex::new(System::new())),
            last_error,
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_mb.saturating_mul(1024 * 1024);

    Router::new()
        .merge(api::separation_routes())
        .merge(api::stem_routes())
        .merge(api::audio_info_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
