//! Stem file retrieval

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::{
    error::{ApiError, ApiResult},
    models::Mode,
    services::{job_orchestrator::STEM_MIME_TYPE, ContentHash},
    AppState,
};

/// GET /api/stems/:hash/:mode/:file
pub async fn get_stem(
    State(state): State<AppState>,
    Path((hash, mode, file)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let hash = ContentHash::parse(&hash)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid content hash: {}", hash)))?;
    let mode: Mode = mode
        .parse()
        .map_err(|e: crate::models::mode::InvalidMode| ApiError::BadRequest(e.to_string()))?;

    let path = state
        .cache
        .stem_file(&hash, mode, &file)
        .ok_or_else(|| ApiError::NotFound(format!("Stem {}/{}/{}", hash, mode, file)))?;

    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ApiError::NotFound(format!("Stem {}/{}/{}", hash, mode, file)),
        _ => ApiError::Io(e),
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, STEM_MIME_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", file),
            ),
        ],
        bytes,
    ))
}

/// Build stem retrieval routes
pub fn stem_routes() -> Router<AppState> {
    Router::new().route("/api/stems/:hash/:mode/:file", get(get_stem))
}
