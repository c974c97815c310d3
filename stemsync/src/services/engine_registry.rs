//! Per-mode engine singletons
//!
//! Engines are expensive (model weights, device memory), so each mode gets at
//! most one, built lazily on first use and kept for the process lifetime.
//!
//! **Concurrency:** `get` reads the published engine without taking the
//! construction lock. On a miss it takes the mode's construction mutex,
//! re-checks, and only then builds. Concurrent first callers block on the
//! mutex and receive the single engine once it is published. A failed
//! construction marks the mode degraded; later calls fail fast.

use crate::models::Mode;
use crate::services::command_backend::{CommandBackend, RunnerCommand};
use crate::services::separation_engine::{
    ModelEngine, SeparationEngine, SeparationError, SyntheticEngine,
};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Builds the engine for a mode
///
/// Called at most once per mode per registry.
pub trait EngineFactory: Send + Sync {
    fn create(&self, mode: Mode) -> Result<Arc<dyn SeparationEngine>, String>;
}

/// Builds [`ModelEngine`]s backed by the external runner
pub struct CommandEngineFactory {
    runner: RunnerCommand,
    scratch_root: PathBuf,
}

impl CommandEngineFactory {
    pub fn new(runner: RunnerCommand, scratch_root: PathBuf) -> Self {
        Self {
            runner,
            scratch_root,
        }
    }
}

impl EngineFactory for CommandEngineFactory {
    fn create(&self, mode: Mode) -> Result<Arc<dyn SeparationEngine>, String> {
        let model_id = mode.profile().model_id;
        let backend = CommandBackend::load(
            self.runner.clone(),
            model_id,
            self.scratch_root.join(model_id),
        )?;
        Ok(Arc::new(ModelEngine::new(mode, Box::new(backend))))
    }
}

/// Builds [`SyntheticEngine`]s
pub struct SyntheticEngineFactory {
    stem_delay: Duration,
}

impl SyntheticEngineFactory {
    pub fn new(stem_delay: Duration) -> Self {
        Self { stem_delay }
    }
}

impl EngineFactory for SyntheticEngineFactory {
    fn create(&self, mode: Mode) -> Result<Arc<dyn SeparationEngine>, String> {
        warn!(mode = %mode, "Using synthetic separation engine; results are fabricated");
        Ok(Arc::new(SyntheticEngine::new(mode, self.stem_delay)))
    }
}

/// Lifecycle of one mode's engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    NotLoaded,
    Loading,
    Ready,
    Degraded,
}

/// Diagnostic snapshot of one mode
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatusReport {
    pub mode: Mode,
    pub model: &'static str,
    pub description: &'static str,
    pub stems: &'static [&'static str],
    pub status: EngineStatus,
    pub ready: bool,
    pub constructions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct ModeSlot {
    engine: RwLock<Option<Arc<dyn SeparationEngine>>>,
    construct: Mutex<()>,
    loading: AtomicBool,
    degraded: RwLock<Option<String>>,
    constructions: AtomicUsize,
}

impl ModeSlot {
    fn published(&self) -> Option<Arc<dyn SeparationEngine>> {
        self.engine
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn degraded_reason(&self) -> Option<String> {
        self.degraded
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Lazily constructed engine per mode
pub struct EngineRegistry {
    factory: Arc<dyn EngineFactory>,
    fast: ModeSlot,
    detailed: ModeSlot,
}

impl EngineRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            fast: ModeSlot::default(),
            detailed: ModeSlot::default(),
        }
    }

    fn slot(&self, mode: Mode) -> &ModeSlot {
        match mode {
            Mode::Fast => &self.fast,
            Mode::Detailed => &self.detailed,
        }
    }

    /// Engine for `mode`, constructing it on first use
    ///
    /// Blocking: may wait for (or perform) model loading. Call from the
    /// blocking pool.
    pub fn get(&self, mode: Mode) -> Result<Arc<dyn SeparationEngine>, SeparationError> {
        let slot = self.slot(mode);

        if let Some(engine) = slot.published() {
            return Ok(engine);
        }
        if let Some(reason) = slot.degraded_reason() {
            return Err(SeparationError::ResourceUnavailable { mode, reason });
        }

        let _construct = slot.construct.lock().unwrap_or_else(|p| p.into_inner());

        // Another caller may have finished while we waited
        if let Some(engine) = slot.published() {
            return Ok(engine);
        }
        if let Some(reason) = slot.degraded_reason() {
            return Err(SeparationError::ResourceUnavailable { mode, reason });
        }

        slot.loading.store(true, Ordering::SeqCst);
        slot.constructions.fetch_add(1, Ordering::SeqCst);
        info!(mode = %mode, model = mode.profile().model_id, "Constructing separation engine");
        let started = Instant::now();

        let created = std::panic::catch_unwind(AssertUnwindSafe(|| self.factory.create(mode)))
            .unwrap_or_else(|_| Err("Engine construction panicked".to_string()));

        let outcome = match created {
            Ok(engine) => {
                *slot.engine.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&engine));
                info!(
                    mode = %mode,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    synthetic = engine.is_synthetic(),
                    "Separation engine ready"
                );
                Ok(engine)
            }
            Err(reason) => {
                error!(mode = %mode, "Separation engine failed to load: {}", reason);
                *slot.degraded.write().unwrap_or_else(|p| p.into_inner()) = Some(reason.clone());
                Err(SeparationError::ResourceUnavailable { mode, reason })
            }
        };

        slot.loading.store(false, Ordering::SeqCst);
        outcome
    }

    /// Published engine, without waiting or constructing
    pub fn try_get(&self, mode: Mode) -> Option<Arc<dyn SeparationEngine>> {
        self.slot(mode).published()
    }

    /// Never blocks
    pub fn status(&self, mode: Mode) -> EngineStatus {
        let slot = self.slot(mode);
        if slot.published().is_some() {
            EngineStatus::Ready
        } else if slot.degraded_reason().is_some() {
            EngineStatus::Degraded
        } else if slot.loading.load(Ordering::SeqCst) {
            EngineStatus::Loading
        } else {
            EngineStatus::NotLoaded
        }
    }

    pub fn is_ready(&self, mode: Mode) -> bool {
        self.status(mode) == EngineStatus::Ready
    }

    /// Number of construction attempts for `mode`
    pub fn construction_count(&self, mode: Mode) -> usize {
        self.slot(mode).constructions.load(Ordering::SeqCst)
    }

    pub fn report(&self, mode: Mode) -> ModeStatusReport {
        let slot = self.slot(mode);
        let profile = mode.profile();
        ModeStatusReport {
            mode,
            model: profile.model_id,
            description: profile.description,
            stems: profile.stems,
            status: self.status(mode),
            ready: self.is_ready(mode),
            constructions: self.construction_count(mode),
            synthetic: slot.published().map(|e| e.is_synthetic()),
            error: slot.degraded_reason(),
        }
    }

    /// Construct engines for `modes` in the background
    pub fn spawn_preload(self: &Arc<Self>, modes: Vec<Mode>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            for mode in modes {
                info!(mode = %mode, "Preloading separation engine");
                if let Err(e) = registry.get(mode) {
                    warn!(mode = %mode, "Preload failed: {}", e);
                }
            }
        })
    }
}
