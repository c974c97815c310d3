//! Separation pipeline services

pub mod audio_codec;
pub mod cache_reaper;
pub mod command_backend;
pub mod content_hasher;
pub mod engine_registry;
pub mod job_orchestrator;
pub mod metrics;
pub mod progress_streamer;
pub mod result_cache;
pub mod separation_engine;

pub use cache_reaper::CacheReaper;
pub use content_hasher::ContentHash;
pub use engine_registry::{
    CommandEngineFactory, EngineFactory, EngineRegistry, EngineStatus, SyntheticEngineFactory,
};
pub use job_orchestrator::{JobFailure, JobOrchestrator, SplitRequest};
pub use progress_streamer::{progress_channel, ProgressReceiver, ProgressSender};
pub use result_cache::{CacheLookup, MissReason, ResultCache};
pub use separation_engine::{
    ModelBackend, ModelEngine, SeparationEngine, SeparationError, SyntheticEngine,
};
