//! Separation endpoints
//!
//! POST /api/split (event stream) and POST /api/split/sync (single JSON)

use axum::{
    body::Bytes,
    extract::{Query, State},
    response::sse::{Event, Sse},
    routing::post,
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use stemsync_common::events::SplitResponse;

use crate::{
    error::ApiResult,
    models::Mode,
    services::SplitRequest,
    AppState,
};

/// Query parameters shared by both split endpoints
#[derive(Debug, Deserialize)]
pub struct SplitQuery {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub job_id: Option<String>,
    pub filename: Option<String>,
}

fn default_mode() -> String {
    Mode::Fast.as_str().to_string()
}

impl SplitQuery {
    fn into_request(self, body: Bytes) -> SplitRequest {
        SplitRequest {
            mode: self.mode,
            job_id: self.job_id,
            filename: self.filename,
            data: body.to_vec(),
        }
    }
}

/// POST /api/split
///
/// Body is the raw audio file. Invalid requests fail with a JSON error
/// before streaming starts; afterwards every outcome arrives as an event.
pub async fn split_stream(
    State(state): State<AppState>,
    Query(query): Query<SplitQuery>,
    body: Bytes,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let accepted = state.orchestrator.submit(query.into_request(body)).await?;

    tracing::debug!(job_id = %accepted.job_id, mode = %accepted.mode, "Streaming separation progress");

    // The worker keeps running if the client goes away; its result still
    // lands in the cache.
    Ok(stemsync_common::sse::progress_sse(accepted.receiver.into_stream()))
}

/// POST /api/split/sync
pub async fn split_sync(
    State(state): State<AppState>,
    Query(query): Query<SplitQuery>,
    body: Bytes,
) -> ApiResult<Json<SplitResponse>> {
    let response = state
        .orchestrator
        .run_to_completion(query.into_request(body))
        .await?;
    Ok(Json(response))
}

/// Build separation routes
pub fn separation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/split", post(split_stream))
        .route("/api/split/sync", post(split_sync))
}
