//! Audio file inspection
//!
//! POST /api/audio-info: container facts for an uploaded file, without
//! separating it.

use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::job::input_base,
    services::{audio_codec, content_hasher},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct AudioInfoQuery {
    pub filename: Option<String>,
}

/// POST /api/audio-info response
#[derive(Debug, Serialize)]
pub struct AudioInfoResponse {
    pub filename: String,
    /// Cache key the file would be stored under
    pub content_hash: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: String,
    /// Whether the file decodes to a non-empty signal
    pub can_split: bool,
}

pub async fn audio_info(
    State(state): State<AppState>,
    Query(query): Query<AudioInfoQuery>,
    body: Bytes,
) -> ApiResult<Json<AudioInfoResponse>> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("No audio data provided".to_string()));
    }

    let filename = query
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or("audio.wav")
        .to_string();

    // Scratch copy so the decoder sees the extension hint
    let scratch_dir = state.uploads_dir.join(format!("info-{}", Uuid::new_v4()));
    let ext = std::path::Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase);
    let scratch_name = match ext {
        Some(ext) => format!("{}.{}", input_base(&filename), ext),
        None => input_base(&filename),
    };
    let scratch_path = scratch_dir.join(scratch_name);

    tokio::fs::create_dir_all(&scratch_dir).await?;
    if let Err(e) = tokio::fs::write(&scratch_path, &body).await {
        let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
        return Err(ApiError::Io(e));
    }

    let probe_path = scratch_path.clone();
    let probed = tokio::task::spawn_blocking(move || audio_codec::probe_info(&probe_path)).await;
    let hashed = content_hasher::hash_file_async(&scratch_path).await;

    if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
        tracing::warn!("Failed to remove {}: {}", scratch_dir.display(), e);
    }

    let info = probed
        .map_err(|e| ApiError::Internal(format!("Audio probe crashed: {}", e)))?
        .map_err(|e| ApiError::BadRequest(format!("Unsupported or corrupt audio: {:#}", e)))?;
    let content_hash = hashed?;

    tracing::debug!(
        filename = %filename,
        content_hash = %content_hash,
        duration = info.duration,
        sample_rate = info.sample_rate,
        channels = info.channels,
        "Probed audio file"
    );

    Ok(Json(AudioInfoResponse {
        filename,
        content_hash: content_hash.to_string(),
        can_split: info.duration > 0.0,
        duration: info.duration,
        sample_rate: info.sample_rate,
        channels: info.channels,
        format: info.format,
    }))
}

/// Build audio info routes
pub fn audio_info_routes() -> Router<AppState> {
    Router::new().route("/api/audio-info", post(audio_info))
}
