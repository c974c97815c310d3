//! Health check and engine status endpoints

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessesToUpdate, System};

use crate::{
    error::{ApiError, ApiResult},
    models::Mode,
    services::{engine_registry::ModeStatusReport, EngineStatus},
    AppState,
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when an engine failed to load
    pub status: String,
    /// Module name ("stemsync")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Git commit the binary was built from
    pub git_hash: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Engine lifecycle per mode
    pub engines: BTreeMap<&'static str, EngineStatus>,
    /// Last error message if any (for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Host and process resource usage
#[derive(Debug, Serialize)]
pub struct ResourceUsage {
    pub system_memory_total_mb: f64,
    pub system_memory_used_mb: f64,
    pub system_memory_percent: f64,
    pub process_memory_mb: f64,
    pub process_cpu_percent: f32,
    pub system_cpu_percent: f32,
}

/// GET /api/model-status response
#[derive(Debug, Serialize)]
pub struct ModelStatusResponse {
    /// True when every mode has a published engine
    pub ready: bool,
    pub modes: Vec<ModeStatusReport>,
    pub resources: ResourceUsage,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let last_error = state.last_error.read().await.clone();

    let engines: BTreeMap<_, _> = Mode::all()
        .iter()
        .map(|mode| (mode.as_str(), state.registry.status(*mode)))
        .collect();
    let degraded = engines.values().any(|s| *s == EngineStatus::Degraded);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        module: "stemsync".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        uptime_seconds,
        engines,
        last_error,
    })
}

/// GET /api/model-status
///
/// Never waits for an engine; loading modes report `loading`.
pub async fn model_status(State(state): State<AppState>) -> ApiResult<Json<ModelStatusResponse>> {
    let modes: Vec<_> = Mode::all().iter().map(|m| state.registry.report(*m)).collect();
    let ready = modes.iter().all(|m| m.ready);

    let system = Arc::clone(&state.system);
    let resources = tokio::task::spawn_blocking(move || sample_resources(&system))
        .await
        .map_err(|e| ApiError::Internal(format!("Resource sampling failed: {}", e)))?;

    Ok(Json(ModelStatusResponse {
        ready,
        modes,
        resources,
    }))
}

fn sample_resources(system: &Mutex<System>) -> ResourceUsage {
    let mut sys = system.lock().unwrap_or_else(|p| p.into_inner());
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    let pid = sysinfo::get_current_pid().ok();
    if let Some(pid) = pid {
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    }
    let process = pid.and_then(|pid| sys.process(pid));

    let total = sys.total_memory() as f64;
    let used = sys.used_memory() as f64;

    ResourceUsage {
        system_memory_total_mb: round1(total / BYTES_PER_MB),
        system_memory_used_mb: round1(used / BYTES_PER_MB),
        system_memory_percent: if total > 0.0 {
            round1(used / total * 100.0)
        } else {
            0.0
        },
        process_memory_mb: round1(process.map(|p| p.memory() as f64).unwrap_or(0.0) / BYTES_PER_MB),
        process_cpu_percent: process.map(|p| p.cpu_usage()).unwrap_or(0.0),
        system_cpu_percent: sys.global_cpu_usage(),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/model-status", get(model_status))
}
