//! Separation result types sent to clients

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-facing description of one stem file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemInfo {
    pub name: String,
    /// Retrieval URL (`/api/stems/<hash>/<mode>/<file>`)
    pub url: String,
    pub mime_type: String,
    /// Seconds
    pub duration: f64,
    pub rms_db: f64,
    pub peak_db: f64,
}

/// Terminal payload of a successful separation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResponse {
    pub success: bool,
    pub job_id: String,
    pub content_hash: String,
    /// Stems in profile order
    pub stems: Vec<StemInfo>,
    pub sample_rate: u32,
    pub mode: String,
    pub model_used: String,
    pub cache_hit: bool,
    /// Results fabricated without a model
    pub synthetic: bool,
}

/// Failure category carried by `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InputError,
    ResourceUnavailable,
    EngineLoading,
    ResourceExhausted,
    ProcessingFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InputError => "input_error",
            FailureKind::ResourceUnavailable => "resource_unavailable",
            FailureKind::EngineLoading => "engine_loading",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::ProcessingFailure => "processing_failure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
