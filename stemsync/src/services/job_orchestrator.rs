//! Separation job driver
//!
//! For each request: validate → save upload → (blocking pool) hash → cache
//! check → engine acquire → separate → publish → exactly one terminal event.
//!
//! Jobs for the same content and mode take turns; a job that waited re-checks
//! the cache and is served the first job's result instead of separating again.
//!
//! Validation happens before any worker starts, so bad requests fail with a
//! plain error instead of an event stream. Once a job is accepted every exit
//! path (success, typed failure, worker panic) ends in one terminal event and
//! the upload is removed.

use crate::models::job::input_base;
use crate::models::{Job, JobState, Mode, SeparationResult};
use crate::services::content_hasher::{self, ContentHash};
use crate::services::engine_registry::{EngineRegistry, EngineStatus};
use crate::services::progress_streamer::{
    progress_channel, ProgressReceiver, ProgressSender, DEFAULT_KEEPALIVE,
};
use crate::services::result_cache::{CacheLookup, ResultCache};
use crate::services::separation_engine::{SeparationError, SeparationInput};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use stemsync_common::events::{FailureKind, ProgressEvent, SplitResponse, StemInfo};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// MIME type of every stem file
pub const STEM_MIME_TYPE: &str = "audio/wav";

const DEFAULT_FILENAME: &str = "audio.wav";
const MAX_JOB_ID_LEN: usize = 64;

/// Raw separation request as received over HTTP
#[derive(Debug, Clone)]
pub struct SplitRequest {
    pub mode: String,
    pub job_id: Option<String>,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Failure reported by a finished job
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<SeparationError> for JobFailure {
    fn from(e: SeparationError) -> Self {
        JobFailure {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// A job that passed validation and is running
pub struct AcceptedJob {
    pub job_id: String,
    pub mode: Mode,
    pub receiver: ProgressReceiver,
    /// Completes after the terminal event is sent and the upload removed
    pub handle: JoinHandle<()>,
}

/// `[A-Za-z0-9_-]{1,64}`
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Retrieval URL of a stem file
pub fn stem_url(hash: &str, mode: Mode, file_name: &str) -> String {
    format!("/api/stems/{}/{}/{}", hash, mode.as_str(), file_name)
}

type InflightKey = (String, Mode);
type InflightTable = Mutex<HashMap<InflightKey, Arc<Mutex<()>>>>;

/// Drives separation jobs
pub struct JobOrchestrator {
    registry: Arc<EngineRegistry>,
    cache: ResultCache,
    uploads_dir: PathBuf,
    keepalive: Duration,
    last_error: Arc<RwLock<Option<String>>>,
    /// One slot per (hash, mode) being separated; identical jobs queue on it
    inflight: InflightTable,
}

impl JobOrchestrator {
    pub fn new(registry: Arc<EngineRegistry>, cache: ResultCache, uploads_dir: PathBuf) -> Self {
        Self {
            registry,
            cache,
            uploads_dir,
            keepalive: DEFAULT_KEEPALIVE,
            last_error: Arc::new(RwLock::new(None)),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Share a slot where failed jobs record their message
    pub fn with_last_error(mut self, last_error: Arc<RwLock<Option<String>>>) -> Self {
        self.last_error = last_error;
        self
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Synchronous checks; nothing is written
    fn validate(&self, request: &SplitRequest) -> Result<(Mode, String, String), SeparationError> {
        let mode: Mode = request
            .mode
            .parse()
            .map_err(|e: crate::models::mode::InvalidMode| SeparationError::InputError(e.to_string()))?;

        if request.data.is_empty() {
            return Err(SeparationError::InputError("No audio data provided".to_string()));
        }

        let job_id = match request.job_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                if !is_valid_job_id(id) {
                    return Err(SeparationError::InputError(format!(
                        "Invalid job id '{}' (expected 1-64 of A-Z a-z 0-9 _ -)",
                        id
                    )));
                }
                id.to_string()
            }
            _ => Uuid::new_v4().to_string(),
        };

        let filename = request
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();

        match self.registry.status(mode) {
            EngineStatus::Loading => return Err(SeparationError::EngineLoading(mode)),
            EngineStatus::Degraded => {
                let reason = self
                    .registry
                    .report(mode)
                    .error
                    .unwrap_or_else(|| "engine failed to load".to_string());
                return Err(SeparationError::ResourceUnavailable { mode, reason });
            }
            EngineStatus::NotLoaded | EngineStatus::Ready => {}
        }

        Ok((mode, job_id, filename))
    }

    /// Validate, save the upload and start the job
    pub async fn submit(self: &Arc<Self>, request: SplitRequest) -> Result<AcceptedJob, SeparationError> {
        let (mode, job_id, filename) = self.validate(&request)?;

        let job_dir = self.uploads_dir.join(&job_id);

        // Keep the client's extension so the decoder gets a format hint
        let upload_name = match Path::new(&filename).extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
                format!("{}.{}", input_base(&filename), ext.to_ascii_lowercase())
            }
            _ => input_base(&filename),
        };
        let input_path = job_dir.join(upload_name);

        tokio::fs::create_dir_all(&self.uploads_dir).await.map_err(|e| {
            SeparationError::ProcessingFailure(format!("Failed to create upload directory: {}", e))
        })?;
        // Creating the job directory is what claims the id
        if let Err(e) = tokio::fs::create_dir(&job_dir).await {
            return Err(if e.kind() == std::io::ErrorKind::AlreadyExists {
                SeparationError::InputError(format!("Job id '{}' is already in use", job_id))
            } else {
                SeparationError::ProcessingFailure(format!("Failed to create upload directory: {}", e))
            });
        }
        if let Err(e) = tokio::fs::write(&input_path, &request.data).await {
            let _ = tokio::fs::remove_dir_all(&job_dir).await;
            return Err(SeparationError::ProcessingFailure(format!(
                "Failed to save upload: {}",
                e
            )));
        }

        info!(
            job_id = %job_id,
            mode = %mode,
            filename = %filename,
            size_bytes = request.data.len(),
            "Separation job accepted"
        );

        let job = Job::new(job_id.clone(), mode, filename, input_path);
        let (sender, receiver) = progress_channel(&job_id, self.keepalive);
        let handle = tokio::spawn(Arc::clone(self).drive(job, job_dir, sender));

        Ok(AcceptedJob {
            job_id,
            mode,
            receiver,
            handle,
        })
    }

    /// Submit and wait for the terminal event
    pub async fn run_to_completion(
        self: &Arc<Self>,
        request: SplitRequest,
    ) -> Result<SplitResponse, JobFailure> {
        let accepted = self.submit(request).await?;
        match accepted.receiver.wait_for_terminal().await {
            ProgressEvent::Complete { result } => Ok(result),
            ProgressEvent::Error { message, kind } => Err(JobFailure { kind, message }),
            other => Err(JobFailure {
                kind: FailureKind::ProcessingFailure,
                message: format!("Unexpected terminal event '{}'", other.event_type()),
            }),
        }
    }

    /// Run the job on the blocking pool and guarantee its terminal event
    async fn drive(self: Arc<Self>, mut job: Job, job_dir: PathBuf, sender: ProgressSender) {
        let job_id = job.job_id.clone();
        let worker = Arc::clone(&self);
        let worker_sender = sender.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let outcome = worker.execute(&mut job, &worker_sender);
            if outcome.is_err() {
                job.transition_to(JobState::Error);
            }
            outcome
        })
        .await;

        let terminal = match joined {
            Ok(Ok(response)) => {
                info!(
                    job_id = %job_id,
                    cache_hit = response.cache_hit,
                    stems = response.stems.len(),
                    "Separation job complete"
                );
                ProgressEvent::Complete { result: response }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, kind = %e.kind(), "Separation job failed: {}", e);
                *self.last_error.write().await = Some(e.to_string());
                ProgressEvent::error(e.to_string(), e.kind())
            }
            Err(join_error) => {
                error!(job_id = %job_id, "Separation worker crashed: {}", join_error);
                let message = "Separation worker crashed unexpectedly".to_string();
                *self.last_error.write().await = Some(message.clone());
                ProgressEvent::error(message, FailureKind::ProcessingFailure)
            }
        };

        // The upload is gone by the time the terminal event is observable
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            warn!(job_id = %job_id, "Failed to remove upload {}: {}", job_dir.display(), e);
        }

        sender.send(terminal);
    }

    /// The blocking pipeline
    fn execute(&self, job: &mut Job, progress: &ProgressSender) -> Result<SplitResponse, SeparationError> {
        progress.progress(2, "Initializing");

        job.transition_to(JobState::CacheCheck);
        progress.progress(3, "Checking cache");

        let hash = content_hasher::hash_file(&job.input_path)
            .map_err(|e| SeparationError::ProcessingFailure(e.to_string()))?;
        let _lease = self.cache.lease(&hash);

        let size_bytes = std::fs::metadata(&job.input_path)
            .map(|m| m.len())
            .unwrap_or(0);
        progress.send(ProgressEvent::Metadata {
            fields: metadata_fields(job, &hash, size_bytes),
        });

        if let CacheLookup::Hit(result) = self.cache.lookup_hash(&hash, job.mode) {
            return Ok(self.serve_cached(job, &hash, &result, progress));
        }

        // An identical job may be separating right now; wait for it and
        // look again before spending another inference
        let slot = self.inflight_slot(&hash, job.mode);
        let _running = match slot.try_lock() {
            Some(guard) => guard,
            None => {
                debug!(job_id = %job.job_id, hash = %hash, "Waiting for identical job");
                progress.progress(4, "Waiting for identical job");
                slot.lock()
            }
        };

        match self.cache.lookup_hash(&hash, job.mode) {
            CacheLookup::Hit(result) => {
                return Ok(self.serve_cached(job, &hash, &result, progress));
            }
            CacheLookup::Miss(reason) => {
                debug!(job_id = %job.job_id, hash = %hash, ?reason, "Cache miss");
                job.transition_to(JobState::CacheMiss);
            }
        }

        job.transition_to(JobState::EngineAcquire);
        let engine = self.registry.get(job.mode)?;

        let staging = self.cache.staging_dir(&hash, job.mode, &job.job_id);
        remove_dir_if_present(&staging);

        job.transition_to(JobState::Separating);
        let input = SeparationInput {
            job_id: job.job_id.clone(),
            input_path: job.input_path.clone(),
            input_base: job.input_base(),
            content_hash: hash.to_string(),
            output_dir: staging.clone(),
        };

        let result = match engine.separate(&input, progress) {
            Ok(result) => result,
            Err(e) => {
                remove_dir_if_present(&staging);
                return Err(e);
            }
        };

        job.transition_to(JobState::Persisting);
        let result = if result.synthetic {
            result
        } else {
            match self.publish(&staging, &hash, result) {
                Ok(published) => published,
                Err(e) => {
                    remove_dir_if_present(&staging);
                    return Err(e);
                }
            }
        };

        progress.progress(100, "Complete!");
        job.transition_to(JobState::Complete);
        Ok(self.to_response(job, &result))
    }

    fn serve_cached(
        &self,
        job: &mut Job,
        hash: &ContentHash,
        result: &SeparationResult,
        progress: &ProgressSender,
    ) -> SplitResponse {
        job.transition_to(JobState::CacheHit);
        info!(job_id = %job.job_id, hash = %hash, mode = %job.mode, "Serving cached result");
        progress.progress(100, "Complete (cached)");
        job.transition_to(JobState::Complete);
        self.to_response(job, result)
    }

    /// Shared slot for (hash, mode); released from the table once unused
    fn inflight_slot(&self, hash: &ContentHash, mode: Mode) -> InflightSlot<'_> {
        let key = (hash.to_string(), mode);
        let mut table = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        let lock = Arc::clone(table.entry(key.clone()).or_default());
        InflightSlot {
            table: &self.inflight,
            key,
            lock,
        }
    }

    /// Move a finished staging directory to the entry's final location
    fn publish(
        &self,
        staging: &Path,
        hash: &ContentHash,
        result: SeparationResult,
    ) -> Result<SeparationResult, SeparationError> {
        let entry = self.cache.entry_dir(hash, result.mode);

        if entry.exists() {
            if let CacheLookup::Hit(existing) = self.cache.lookup_hash(hash, result.mode) {
                // A concurrent job published the same content first
                debug!(hash = %hash, "Entry already published; discarding staging copy");
                remove_dir_if_present(staging);
                return Ok(SeparationResult {
                    cache_hit: false,
                    ..existing
                });
            }
            std::fs::remove_dir_all(&entry).map_err(|e| {
                SeparationError::ProcessingFailure(format!("Failed to replace broken cache entry: {}", e))
            })?;
        }

        std::fs::rename(staging, &entry).map_err(|e| {
            SeparationError::ProcessingFailure(format!("Failed to publish results: {}", e))
        })?;

        let stems = result
            .stems
            .into_iter()
            .map(|mut stem| {
                stem.path = stem
                    .path
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .map(|name| entry.join(name));
                stem
            })
            .collect();

        Ok(SeparationResult {
            stems,
            output_dir: entry,
            ..result
        })
    }

    fn to_response(&self, job: &Job, result: &SeparationResult) -> SplitResponse {
        let stems = result
            .stems
            .iter()
            .map(|stem| StemInfo {
                name: stem.name.clone(),
                url: stem
                    .file_name()
                    .map(|f| stem_url(&result.content_hash, result.mode, &f))
                    .unwrap_or_default(),
                mime_type: STEM_MIME_TYPE.to_string(),
                duration: stem.duration,
                rms_db: stem.rms_db,
                peak_db: stem.peak_db,
            })
            .collect();

        SplitResponse {
            success: true,
            job_id: job.job_id.clone(),
            content_hash: result.content_hash.clone(),
            stems,
            sample_rate: result.sample_rate,
            mode: result.mode.as_str().to_string(),
            model_used: result.model_id().to_string(),
            cache_hit: result.cache_hit,
            synthetic: result.synthetic,
        }
    }
}

/// Handle on one in-flight slot
struct InflightSlot<'a> {
    table: &'a InflightTable,
    key: InflightKey,
    lock: Arc<Mutex<()>>,
}

impl InflightSlot<'_> {
    fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        // Two references left: the table's and ours
        if Arc::strong_count(&self.lock) <= 2 {
            table.remove(&self.key);
        }
    }
}

fn metadata_fields(job: &Job, hash: &ContentHash, size_bytes: u64) -> Map<String, Value> {
    let value = json!({
        "filename": job.filename,
        "size_bytes": size_bytes,
        "content_hash": hash.as_str(),
        "mode": job.mode.as_str(),
        "model": job.mode.profile().model_id,
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn remove_dir_if_present(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}
