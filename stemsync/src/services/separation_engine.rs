//! Separation engines
//!
//! A `SeparationEngine` owns one loaded model for one mode and turns an input
//! file into a set of normalized stem files. Two strategies exist:
//!
//! - [`ModelEngine`]: runs a [`ModelBackend`] (the opaque neural model) and
//!   persists its output
//! - [`SyntheticEngine`]: fabricates plausible results without a model, for
//!   exercising the interface when no model is installed
//!
//! The strategy is chosen once, when the engine factory builds the engine.

use crate::models::{Mode, SeparationResult, StemResult};
use crate::services::audio_codec::{self, PcmAudio};
use crate::services::metrics::{self, NORMALIZE_TARGET_DB};
use crate::services::progress_streamer::ProgressSender;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use stemsync_common::events::FailureKind;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Client-facing message for out-of-memory failures
pub const OUT_OF_MEMORY_MESSAGE: &str =
    "Out of memory during separation. Try a shorter audio file.";

/// Separation failure taxonomy
#[derive(Debug, Clone, Error)]
pub enum SeparationError {
    /// Bad request data (empty upload, unknown mode, undecodable audio)
    #[error("{0}")]
    InputError(String),

    /// Engine for this mode failed to load
    #[error("Separation engine for '{mode}' is unavailable: {reason}")]
    ResourceUnavailable { mode: Mode, reason: String },

    /// Engine for this mode is being constructed by another request
    #[error("Separation engine for '{0}' is still loading; retry shortly")]
    EngineLoading(Mode),

    /// Model ran out of memory
    #[error("{}", OUT_OF_MEMORY_MESSAGE)]
    ResourceExhausted(String),

    /// Anything else that went wrong while separating or persisting
    #[error("Separation failed: {0}")]
    ProcessingFailure(String),
}

impl SeparationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SeparationError::InputError(_) => FailureKind::InputError,
            SeparationError::ResourceUnavailable { .. } => FailureKind::ResourceUnavailable,
            SeparationError::EngineLoading(_) => FailureKind::EngineLoading,
            SeparationError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            SeparationError::ProcessingFailure(_) => FailureKind::ProcessingFailure,
        }
    }
}

/// Everything an engine needs for one job
#[derive(Debug, Clone)]
pub struct SeparationInput {
    pub job_id: String,
    /// Decodable audio file
    pub input_path: PathBuf,
    /// Prefix of stem file names
    pub input_base: String,
    pub content_hash: String,
    /// Directory the stem files are written to (created if missing)
    pub output_dir: PathBuf,
}

impl SeparationInput {
    pub fn stem_file_name(&self, stem: &str, model_id: &str) -> String {
        format!("{}_{}_{}.wav", self.input_base, stem, model_id)
    }
}

/// One loaded model bound to one mode
pub trait SeparationEngine: Send + Sync {
    fn mode(&self) -> Mode;

    /// Whether results are fabricated
    fn is_synthetic(&self) -> bool;

    /// Separate `input` on the calling thread, reporting milestones
    ///
    /// Blocking; call from the blocking pool.
    fn separate(
        &self,
        input: &SeparationInput,
        progress: &ProgressSender,
    ) -> Result<SeparationResult, SeparationError>;
}

/// Failure reported by a model backend
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("{0}")]
    Failed(String),
}

impl InferenceError {
    /// Classify a raw backend message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_ascii_lowercase().contains("out of memory") {
            InferenceError::OutOfMemory(message)
        } else {
            InferenceError::Failed(message)
        }
    }
}

/// The opaque separation model: stereo waveform in, named stems out
pub trait ModelBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Run inference on stereo audio at the profile sample rate
    ///
    /// Returns one buffer per requested stem name.
    fn infer(&self, audio: &PcmAudio, stems: &[&str])
        -> Result<Vec<(String, PcmAudio)>, InferenceError>;

    /// Free per-run device resources (GPU memory, scratch files)
    fn release(&self) {}
}

/// Calls `ModelBackend::release` however the inference scope is left
struct ReleaseGuard<'a>(&'a dyn ModelBackend);

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Engine running a real model backend
///
/// Holds an execution lock for the whole of `separate`, so jobs of one mode
/// run one at a time while different modes proceed in parallel.
pub struct ModelEngine {
    mode: Mode,
    backend: Box<dyn ModelBackend>,
    exec: Mutex<()>,
}

impl ModelEngine {
    pub fn new(mode: Mode, backend: Box<dyn ModelBackend>) -> Self {
        Self {
            mode,
            backend,
            exec: Mutex::new(()),
        }
    }

    fn load_input(&self, input: &SeparationInput) -> Result<PcmAudio, SeparationError> {
        let audio = audio_codec::decode_file(&input.input_path)
            .map_err(|e| SeparationError::InputError(format!("Could not decode audio: {:#}", e)))?;

        if audio.is_empty() {
            return Err(SeparationError::InputError(
                "Audio file contains no samples".to_string(),
            ));
        }
        Ok(audio)
    }

    /// Order backend output by profile and check the stem set is exact
    fn validate_stems(
        &self,
        output: Vec<(String, PcmAudio)>,
    ) -> Result<Vec<(&'static str, PcmAudio)>, SeparationError> {
        let profile = self.mode.profile();
        let mut by_name: HashMap<String, PcmAudio> = HashMap::with_capacity(output.len());

        for (name, audio) in output {
            if by_name.insert(name.clone(), audio).is_some() {
                return Err(SeparationError::ProcessingFailure(format!(
                    "Model returned stem '{}' more than once",
                    name
                )));
            }
        }

        let mut ordered = Vec::with_capacity(profile.stems.len());
        for &stem in profile.stems {
            let audio = by_name.remove(stem).ok_or_else(|| {
                SeparationError::ProcessingFailure(format!("Model did not return stem '{}'", stem))
            })?;
            ordered.push((stem, audio));
        }

        if let Some(extra) = by_name.keys().next() {
            return Err(SeparationError::ProcessingFailure(format!(
                "Model returned unexpected stem '{}'",
                extra
            )));
        }

        Ok(ordered)
    }
}

impl SeparationEngine for ModelEngine {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn is_synthetic(&self) -> bool {
        false
    }

    fn separate(
        &self,
        input: &SeparationInput,
        progress: &ProgressSender,
    ) -> Result<SeparationResult, SeparationError> {
        let _exec = self.exec.lock().unwrap_or_else(|p| p.into_inner());
        let profile = self.mode.profile();
        let stem_count = profile.stems.len();

        progress.progress(5, "Loading audio");
        let audio = self.load_input(input)?;

        progress.progress_with_detail(
            10,
            "Analyzing waveform",
            format!(
                "{:.1}s, {} Hz, {} channel(s)",
                audio.duration_secs(),
                audio.sample_rate,
                audio.channels
            ),
        );
        let audio = audio_codec::coerce_stereo(audio);

        progress.progress(15, "Preparing audio");
        let audio = audio_codec::resample(audio, profile.sample_rate)
            .map_err(|e| SeparationError::ProcessingFailure(format!("Resampling failed: {:#}", e)))?;

        progress.progress(20, "Preparing model input");
        progress.progress_with_detail(25, "Starting inference", profile.model_id);
        progress.progress(30, format!("Separating stems (0/{})", stem_count));

        let output = {
            let _release = ReleaseGuard(self.backend.as_ref());
            info!(
                job_id = %input.job_id,
                mode = %self.mode,
                backend = self.backend.name(),
                frames = audio.frames(),
                "Running inference"
            );
            self.backend
                .infer(&audio, profile.stems)
                .map_err(|e| match e {
                    InferenceError::OutOfMemory(msg) => {
                        warn!(job_id = %input.job_id, "Inference out of memory: {}", msg);
                        SeparationError::ResourceExhausted(msg)
                    }
                    InferenceError::Failed(msg) => SeparationError::ProcessingFailure(msg),
                })?
        };

        progress.progress(70, "Inference complete");
        let stems = self.validate_stems(output)?;

        std::fs::create_dir_all(&input.output_dir).map_err(|e| {
            SeparationError::ProcessingFailure(format!(
                "Failed to create {}: {}",
                input.output_dir.display(),
                e
            ))
        })?;

        let mut results = Vec::with_capacity(stem_count);
        for (i, (name, stem_audio)) in stems.into_iter().enumerate() {
            let percent = (70 + (i + 1) * 25 / stem_count) as u8;
            progress.progress(percent, format!("Saving {} stem...", name));

            let stem_audio = audio_codec::coerce_stereo(stem_audio);
            let mut stem_audio = audio_codec::resample(stem_audio, profile.sample_rate)
                .map_err(|e| SeparationError::ProcessingFailure(format!("{:#}", e)))?;
            metrics::normalize_peak(&mut stem_audio, NORMALIZE_TARGET_DB);
            let m = metrics::calculate(&stem_audio);

            let path = input
                .output_dir
                .join(input.stem_file_name(name, profile.model_id));
            audio_codec::write_wav(&path, &stem_audio).map_err(|e| {
                SeparationError::ProcessingFailure(format!("Failed to write {} stem: {:#}", name, e))
            })?;

            debug!(job_id = %input.job_id, stem = name, rms_db = m.rms_db, "Stem written");
            results.push(StemResult {
                name: name.to_string(),
                path: Some(path),
                duration: m.duration,
                rms_db: m.rms_db,
                peak_db: m.peak_db,
            });
        }

        Ok(SeparationResult {
            stems: results,
            sample_rate: profile.sample_rate,
            mode: self.mode,
            content_hash: input.content_hash.clone(),
            cache_hit: false,
            output_dir: input.output_dir.clone(),
            synthetic: false,
        })
    }
}

/// Engine producing fabricated results without a model
pub struct SyntheticEngine {
    mode: Mode,
    stem_delay: Duration,
}

/// Default pause per stem, to mimic real work
pub const SYNTHETIC_STEM_DELAY: Duration = Duration::from_millis(300);

impl SyntheticEngine {
    pub fn new(mode: Mode, stem_delay: Duration) -> Self {
        Self { mode, stem_delay }
    }

    /// Typical (rms_db floor, spread) for a stem type
    fn rms_range(stem: &str) -> (f64, f64) {
        match stem {
            "vocals" => (-10.0, 6.0),
            "drums" => (-12.0, 6.0),
            "bass" => (-16.0, 6.0),
            "guitar" => (-14.0, 6.0),
            "piano" => (-18.0, 6.0),
            _ => (-20.0, 6.0),
        }
    }
}

impl SeparationEngine for SyntheticEngine {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    fn separate(
        &self,
        input: &SeparationInput,
        progress: &ProgressSender,
    ) -> Result<SeparationResult, SeparationError> {
        let profile = self.mode.profile();
        let stem_count = profile.stems.len();
        let mut rng = rand::thread_rng();

        progress.progress(5, "Loading audio");
        let duration = match audio_codec::probe_info(&input.input_path) {
            Ok(info) => info.duration,
            Err(e) => {
                debug!(job_id = %input.job_id, "Synthetic engine could not probe input: {:#}", e);
                180.0 + rng.gen::<f64>() * 60.0
            }
        };

        progress.progress(10, "Analyzing waveform");
        progress.progress(15, "Preparing audio");
        progress.progress(20, "Preparing model input");
        progress.progress_with_detail(25, "Starting inference", "synthetic");
        progress.progress(30, format!("Separating stems (0/{})", stem_count));
        progress.progress(70, "Inference complete");

        let mut stems = Vec::with_capacity(stem_count);
        for (i, &name) in profile.stems.iter().enumerate() {
            let percent = (70 + (i + 1) * 25 / stem_count) as u8;
            progress.progress(percent, format!("Saving {} stem...", name));
            std::thread::sleep(self.stem_delay);

            let (floor, spread) = Self::rms_range(name);
            stems.push(StemResult {
                name: name.to_string(),
                path: None,
                duration,
                rms_db: floor + rng.gen::<f64>() * spread,
                peak_db: -3.0 + rng.gen::<f64>() * 2.0,
            });
        }

        Ok(SeparationResult {
            stems,
            sample_rate: profile.sample_rate,
            mode: self.mode,
            content_hash: input.content_hash.clone(),
            cache_hit: false,
            output_dir: input.output_dir.clone(),
            synthetic: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::progress_streamer::{progress_channel, DEFAULT_KEEPALIVE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use stemsync_common::events::ProgressEvent;
    use tempfile::TempDir;

    /// Returns scaled copies of the input, one per requested stem
    struct ScalingBackend {
        released: Arc<AtomicUsize>,
        fail_with: Option<String>,
        skip_stem: Option<&'static str>,
    }

    impl ModelBackend for ScalingBackend {
        fn name(&self) -> &'static str {
            "scaling"
        }

        fn infer(
            &self,
            audio: &PcmAudio,
            stems: &[&str],
        ) -> Result<Vec<(String, PcmAudio)>, InferenceError> {
            if let Some(msg) = &self.fail_with {
                return Err(InferenceError::from_message(msg.clone()));
            }
            Ok(stems
                .iter()
                .filter(|s| Some(**s) != self.skip_stem)
                .enumerate()
                .map(|(i, s)| {
                    let gain = 0.1 * (i + 1) as f32;
                    let samples = audio.samples.iter().map(|x| x * gain).collect();
                    (s.to_string(), PcmAudio::new(samples, audio.sample_rate, 2))
                })
                .collect())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn backend(fail_with: Option<&str>) -> (ScalingBackend, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        (
            ScalingBackend {
                released: Arc::clone(&released),
                fail_with: fail_with.map(str::to_string),
                skip_stem: None,
            },
            released,
        )
    }

    fn write_input(dir: &TempDir, channels: u16) -> PathBuf {
        let rate = 44100;
        let frames = rate as usize / 2;
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let s = (2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32).sin() * 0.3;
            for _ in 0..channels {
                samples.push(s);
            }
        }
        let path = dir.path().join("input.wav");
        audio_codec::write_wav(&path, &PcmAudio::new(samples, rate, channels)).unwrap();
        path
    }

    fn input(dir: &TempDir, channels: u16) -> SeparationInput {
        SeparationInput {
            job_id: "job-1".to_string(),
            input_path: write_input(dir, channels),
            input_base: "input".to_string(),
            content_hash: "0123456789abcdef".to_string(),
            output_dir: dir.path().join("out"),
        }
    }

    #[test]
    fn test_model_engine_writes_profile_stems() {
        let dir = TempDir::new().unwrap();
        let (backend, released) = backend(None);
        let engine = ModelEngine::new(Mode::Fast, Box::new(backend));
        let (tx, _rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);

        let result = engine.separate(&input(&dir, 1), &tx).unwrap();

        assert_eq!(result.stem_names(), vec!["drums", "bass", "other", "vocals"]);
        assert_eq!(result.sample_rate, 44100);
        assert!(!result.synthetic);
        for stem in &result.stems {
            let path = stem.path.as_ref().unwrap();
            assert!(path.exists());
            assert!(path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with(&format!("_{}_htdemucs.wav", stem.name)));
            assert!((stem.peak_db - NORMALIZE_TARGET_DB).abs() < 0.01);
            assert!((stem.duration - 0.5).abs() < 1e-3);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_model_engine_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let (backend, _) = backend(None);
        let engine = ModelEngine::new(Mode::Detailed, Box::new(backend));
        let (tx, rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);

        engine.separate(&input(&dir, 2), &tx).unwrap();
        tx.send(ProgressEvent::error("end", FailureKind::ProcessingFailure));

        use futures::StreamExt;
        let percents: Vec<u8> = rx
            .into_stream()
            .filter_map(|item| async move {
                match item {
                    stemsync_common::StreamItem::Event(ProgressEvent::Progress { percent, .. }) => {
                        Some(percent)
                    }
                    _ => None,
                }
            })
            .collect()
            .await;

        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert_eq!(percents.last(), Some(&95));
    }

    #[test]
    fn test_out_of_memory_is_resource_exhausted() {
        let dir = TempDir::new().unwrap();
        let (backend, released) = backend(Some("CUDA out of memory. Tried to allocate 2 GiB"));
        let engine = ModelEngine::new(Mode::Fast, Box::new(backend));
        let (tx, _rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);

        let err = engine.separate(&input(&dir, 2), &tx).unwrap_err();
        assert!(matches!(err, SeparationError::ResourceExhausted(_)));
        assert_eq!(err.kind(), FailureKind::ResourceExhausted);
        assert!(err.to_string().contains("shorter"));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_other_failure_is_processing_failure() {
        let dir = TempDir::new().unwrap();
        let (backend, _) = backend(Some("weights corrupted"));
        let engine = ModelEngine::new(Mode::Fast, Box::new(backend));
        let (tx, _rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);

        let err = engine.separate(&input(&dir, 2), &tx).unwrap_err();
        match err {
            SeparationError::ProcessingFailure(msg) => assert_eq!(msg, "weights corrupted"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_stem_rejected() {
        let dir = TempDir::new().unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        let backend = ScalingBackend {
            released,
            fail_with: None,
            skip_stem: Some("bass"),
        };
        let engine = ModelEngine::new(Mode::Fast, Box::new(backend));
        let (tx, _rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);

        let err = engine.separate(&input(&dir, 2), &tx).unwrap_err();
        assert!(err.to_string().contains("bass"));
    }

    #[test]
    fn test_undecodable_input_is_input_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.wav");
        std::fs::write(&path, b"not audio").unwrap();
        let (backend, _) = backend(None);
        let engine = ModelEngine::new(Mode::Fast, Box::new(backend));
        let (tx, _rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);

        let input = SeparationInput {
            job_id: "job-1".to_string(),
            input_path: path,
            input_base: "bad".to_string(),
            content_hash: "0123456789abcdef".to_string(),
            output_dir: dir.path().join("out"),
        };
        let err = engine.separate(&input, &tx).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InputError);
    }

    #[test]
    fn test_synthetic_engine_fabricates_without_files() {
        let dir = TempDir::new().unwrap();
        let engine = SyntheticEngine::new(Mode::Detailed, Duration::ZERO);
        let (tx, _rx) = progress_channel("job-1", DEFAULT_KEEPALIVE);
        let input = input(&dir, 2);

        let result = engine.separate(&input, &tx).unwrap();

        assert!(result.synthetic);
        assert_eq!(result.stems.len(), 6);
        assert!(result.stems.iter().all(|s| s.path.is_none()));
        assert!(result.stems.iter().all(|s| (s.duration - 0.5).abs() < 1e-3));
        let vocals = result.stems.iter().find(|s| s.name == "vocals").unwrap();
        assert!((-10.0..=-4.0).contains(&vocals.rms_db));
        assert!(!input.output_dir.exists());
    }

    #[test]
    fn test_inference_error_classification() {
        assert!(matches!(
            InferenceError::from_message("RuntimeError: CUDA Out Of Memory"),
            InferenceError::OutOfMemory(_)
        ));
        assert!(matches!(
            InferenceError::from_message("segfault"),
            InferenceError::Failed(_)
        ));
    }
}
