//! Separation job state machine
//!
//! QUEUED → CACHE_CHECK → CACHE_HIT → COMPLETE
//! QUEUED → CACHE_CHECK → CACHE_MISS → ENGINE_ACQUIRE → SEPARATING → PERSISTING → COMPLETE
//! Any state may move to ERROR.

use super::Mode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Job workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    CacheCheck,
    CacheHit,
    CacheMiss,
    EngineAcquire,
    Separating,
    Persisting,
    Complete,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Queued, CacheCheck)
                | (CacheCheck, CacheHit)
                | (CacheCheck, CacheMiss)
                | (CacheHit, Complete)
                | (CacheMiss, EngineAcquire)
                | (EngineAcquire, Separating)
                | (Separating, Persisting)
                | (Persisting, Complete)
        )
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub job_id: String,
    pub old_state: JobState,
    pub new_state: JobState,
    pub transitioned_at: DateTime<Utc>,
}

/// One separation request moving through the pipeline
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub mode: Mode,
    /// Original client filename
    pub filename: String,
    /// Saved upload
    pub input_path: PathBuf,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_id: String, mode: Mode, filename: String, input_path: PathBuf) -> Self {
        Self {
            job_id,
            mode,
            filename,
            input_path,
            state: JobState::Queued,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move to `new_state`
    ///
    /// Illegal transitions are logged and still applied; the state machine is
    /// driven only by the orchestrator, so a warning here is a bug report.
    pub fn transition_to(&mut self, new_state: JobState) -> StateTransition {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(
                job_id = %self.job_id,
                from = ?self.state,
                to = ?new_state,
                "Unexpected job state transition"
            );
        }

        let transition = StateTransition {
            job_id: self.job_id.clone(),
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }

        transition
    }

    /// Base name used in stem file names (`<inputBase>_<stem>_<modelId>.wav`)
    pub fn input_base(&self) -> String {
        input_base(&self.filename)
    }
}

/// File stem of a client filename, restricted to a safe character set
pub fn input_base(filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "audio".to_string()
    } else {
        trimmed.chars().take(64).collect()
    }
}
