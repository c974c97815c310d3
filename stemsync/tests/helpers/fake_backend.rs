//! Deterministic model backend and counting engine factory
//!
//! The gain backend returns each stem as the input scaled by a per-stem
//! factor, so results are reproducible and exercise the full write path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stemsync::models::Mode;
use stemsync::services::audio_codec::PcmAudio;
use stemsync::services::separation_engine::InferenceError;
use stemsync::services::{EngineFactory, ModelBackend, ModelEngine, SeparationEngine};

/// Scales the input per stem, optionally sleeping to simulate inference
pub struct GainBackend {
    pub infer_delay: Duration,
    /// Bumped once per inference call
    pub inferences: Arc<AtomicUsize>,
}

impl ModelBackend for GainBackend {
    fn name(&self) -> &'static str {
        "gain"
    }

    fn infer(
        &self,
        audio: &PcmAudio,
        stems: &[&str],
    ) -> Result<Vec<(String, PcmAudio)>, InferenceError> {
        self.inferences.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.infer_delay);
        Ok(stems
            .iter()
            .enumerate()
            .map(|(i, stem)| {
                let gain = 1.0 / (i + 2) as f32;
                let samples = audio.samples.iter().map(|x| x * gain).collect();
                (
                    stem.to_string(),
                    PcmAudio::new(samples, audio.sample_rate, audio.channels),
                )
            })
            .collect())
    }
}

/// Builds [`ModelEngine`]s over [`GainBackend`] and counts constructions
pub struct CountingFactory {
    pub constructions: Arc<AtomicUsize>,
    pub inferences: Arc<AtomicUsize>,
    pub load_delay: Duration,
    pub infer_delay: Duration,
}

impl CountingFactory {
    pub fn new(load_delay: Duration, infer_delay: Duration) -> Self {
        Self {
            constructions: Arc::new(AtomicUsize::new(0)),
            inferences: Arc::new(AtomicUsize::new(0)),
            load_delay,
            infer_delay,
        }
    }

    pub fn count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Inference calls across every engine this factory built
    pub fn inference_count(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }
}

impl EngineFactory for CountingFactory {
    fn create(&self, mode: Mode) -> Result<Arc<dyn SeparationEngine>, String> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        Ok(Arc::new(ModelEngine::new(
            mode,
            Box::new(GainBackend {
                infer_delay: self.infer_delay,
                inferences: Arc::clone(&self.inferences),
            }),
        )))
    }
}
