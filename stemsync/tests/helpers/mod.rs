//! Test Helper Utilities
//!
//! Shared utilities for testing stemsync

#![allow(dead_code)]

pub mod audio_generator;
pub mod fake_backend;

pub use audio_generator::{generate_test_wav, generate_test_wav_bytes, AudioConfig};
pub use fake_backend::{CountingFactory, GainBackend};

use std::path::Path;
use std::sync::Arc;
use stemsync::services::{EngineFactory, EngineRegistry, ResultCache};
use stemsync::AppState;
use stemsync_common::config::{RootFolderInitializer, TomlConfig};

/// App state rooted in `root`, with the given engine factory
pub fn create_test_state(root: &Path, factory: Arc<dyn EngineFactory>) -> AppState {
    let initializer = RootFolderInitializer::new(root.to_path_buf());
    initializer
        .ensure_directory_exists()
        .expect("Failed to create test root");

    let mut config = TomlConfig::default();
    config.root_folder = Some(root.to_path_buf());
    config.engine.keepalive_ms = 20;

    AppState::new(
        Arc::new(EngineRegistry::new(factory)),
        ResultCache::new(initializer.outputs_dir()),
        initializer.uploads_dir(),
        config,
    )
}
