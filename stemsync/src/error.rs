//! Error types for stemsync
//!
//! Maps the separation failure taxonomy onto HTTP responses with a
//! `{"error": {"code", "message"}}` body.

use crate::services::{JobFailure, SeparationError};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stemsync_common::events::FailureKind;
use thiserror::Error;

/// Seconds clients should wait before retrying while an engine loads
pub const ENGINE_LOADING_RETRY_AFTER_SECS: u64 = 5;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Engine failed to load (503)
    #[error("{0}")]
    EngineUnavailable(String),

    /// Engine still loading (503 + Retry-After)
    #[error("{0}")]
    EngineLoading(String),

    /// Model ran out of memory (413)
    #[error("{0}")]
    ResourceExhausted(String),

    /// Separation failed (500)
    #[error("{0}")]
    ProcessingFailed(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// stemsync-common error
    #[error("Common error: {0}")]
    Common(#[from] stemsync_common::Error),
}

impl ApiError {
    fn from_kind(kind: FailureKind, message: String) -> Self {
        match kind {
            FailureKind::InputError => ApiError::BadRequest(message),
            FailureKind::ResourceUnavailable => ApiError::EngineUnavailable(message),
            FailureKind::EngineLoading => ApiError::EngineLoading(message),
            FailureKind::ResourceExhausted => ApiError::ResourceExhausted(message),
            FailureKind::ProcessingFailure => ApiError::ProcessingFailed(message),
        }
    }
}

impl From<SeparationError> for ApiError {
    fn from(e: SeparationError) -> Self {
        let kind = e.kind();
        ApiError::from_kind(kind, e.to_string())
    }
}

impl From<JobFailure> for ApiError {
    fn from(f: JobFailure) -> Self {
        ApiError::from_kind(f.kind, f.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::EngineUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ENGINE_UNAVAILABLE", msg)
            }
            ApiError::EngineLoading(msg) => {
                let body = Json(json!({
                    "error": {
                        "code": "ENGINE_LOADING",
                        "message": msg,
                    }
                }));
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, ENGINE_LOADING_RETRY_AFTER_SECS.to_string())],
                    body,
                )
                    .into_response();
            }
            ApiError::ResourceExhausted(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "RESOURCE_EXHAUSTED", msg)
            }
            ApiError::ProcessingFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PROCESSING_FAILED", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                err.to_string(),
            ),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
