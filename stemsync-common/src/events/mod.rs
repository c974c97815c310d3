//! Progress event types for stemsync jobs
//!
//! Every job emits zero or more `Progress`/`Metadata` events followed by
//! exactly one terminal event (`Complete` or `Error`). Events serialize to the
//! `event: <type>` / `data: <json>` frames sent to streaming clients.

mod split_types;

pub use split_types::{FailureKind, SplitResponse, StemInfo};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One event in a job's progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// Stage milestone
    Progress {
        /// 0..=100, non-decreasing within a job
        percent: u8,
        /// Short stage label shown to users
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Free-form facts about the job (file size, content hash, model)
    Metadata { fields: Map<String, Value> },

    /// Terminal: job finished with a result
    Complete { result: SplitResponse },

    /// Terminal: job failed
    Error { message: String, kind: FailureKind },
}

impl ProgressEvent {
    pub fn progress(percent: u8, stage: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            percent: percent.min(100),
            stage: stage.into(),
            detail: None,
        }
    }

    pub fn progress_with_detail(
        percent: u8,
        stage: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        ProgressEvent::Progress {
            percent: percent.min(100),
            stage: stage.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn error(message: impl Into<String>, kind: FailureKind) -> Self {
        ProgressEvent::Error {
            message: message.into(),
            kind,
        }
    }

    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Metadata { .. } => "metadata",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }

    /// True for `Complete` and `Error`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        )
    }

    /// JSON payload carried in the `data:` line
    pub fn data_json(&self) -> Value {
        match self {
            ProgressEvent::Progress {
                percent,
                stage,
                detail,
            } => json!({
                "percent": percent,
                "stage": stage,
                "detail": detail,
            }),
            ProgressEvent::Metadata { fields } => Value::Object(fields.clone()),
            ProgressEvent::Complete { result } => {
                serde_json::to_value(result).unwrap_or_else(|_| json!({ "success": true }))
            }
            ProgressEvent::Error { message, kind } => json!({
                "error": message,
                "kind": kind,
            }),
        }
    }
}

/// One item produced by a job's progress stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(ProgressEvent),
    /// Idle tick, rendered as an SSE comment
    Keepalive,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> SplitResponse {
        SplitResponse {
            success: true,
            job_id: "job-1".to_string(),
            content_hash: "0123456789abcdef".to_string(),
            stems: vec![StemInfo {
                name: "vocals".to_string(),
                url: "/api/stems/0123456789abcdef/fast/song_vocals_htdemucs.wav".to_string(),
                mime_type: "audio/wav".to_string(),
                duration: 10.0,
                rms_db: -12.5,
                peak_db: -1.0,
            }],
            sample_rate: 44100,
            mode: "fast".to_string(),
            model_used: "htdemucs".to_string(),
            cache_hit: false,
            synthetic: false,
        }
    }

    #[test]
    fn test_event_types() {
        assert_eq!(ProgressEvent::progress(5, "Loading audio").event_type(), "progress");
        assert_eq!(
            ProgressEvent::Metadata { fields: Map::new() }.event_type(),
            "metadata"
        );
        assert_eq!(
            ProgressEvent::Complete { result: sample_response() }.event_type(),
            "complete"
        );
        assert_eq!(
            ProgressEvent::error("boom", FailureKind::ProcessingFailure).event_type(),
            "error"
        );
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!ProgressEvent::progress(10, "x").is_terminal());
        assert!(!ProgressEvent::Metadata { fields: Map::new() }.is_terminal());
        assert!(ProgressEvent::Complete { result: sample_response() }.is_terminal());
        assert!(ProgressEvent::error("x", FailureKind::InputError).is_terminal());
    }

    #[test]
    fn test_progress_percent_clamped() {
        match ProgressEvent::progress(150, "x") {
            ProgressEvent::Progress { percent, .. } => assert_eq!(percent, 100),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_error_payload_shape() {
        let data = ProgressEvent::error("Out of memory", FailureKind::ResourceExhausted).data_json();
        assert_eq!(data["error"], "Out of memory");
        assert_eq!(data["kind"], "resource_exhausted");
    }

    #[test]
    fn test_complete_payload_shape() {
        let data = ProgressEvent::Complete { result: sample_response() }.data_json();
        assert_eq!(data["success"], true);
        assert_eq!(data["content_hash"], "0123456789abcdef");
        assert_eq!(data["stems"][0]["mime_type"], "audio/wav");
        assert_eq!(data["sample_rate"], 44100);
        assert_eq!(data["cache_hit"], false);
    }

    #[test]
    fn test_progress_payload_keeps_null_detail() {
        let data = ProgressEvent::progress(25, "Starting inference").data_json();
        assert_eq!(data["percent"], 25);
        assert_eq!(data["stage"], "Starting inference");
        assert!(data["detail"].is_null());
    }
}
