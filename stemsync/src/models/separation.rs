//! Separation result records

use super::Mode;
use serde::Serialize;
use std::path::PathBuf;

/// One separated stem
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StemResult {
    pub name: String,
    /// Stem file; `None` for synthetic results
    pub path: Option<PathBuf>,
    /// Seconds
    pub duration: f64,
    pub rms_db: f64,
    pub peak_db: f64,
}

impl StemResult {
    pub fn file_name(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Outcome of a successful separation or cache hit
#[derive(Debug, Clone, Serialize)]
pub struct SeparationResult {
    /// Stems in profile order
    pub stems: Vec<StemResult>,
    pub sample_rate: u32,
    pub mode: Mode,
    pub content_hash: String,
    pub cache_hit: bool,
    /// Directory holding the stem files
    pub output_dir: PathBuf,
    pub synthetic: bool,
}

impl SeparationResult {
    pub fn model_id(&self) -> &'static str {
        self.mode.profile().model_id
    }

    pub fn stem_names(&self) -> Vec<&str> {
        self.stems.iter().map(|s| s.name.as_str()).collect()
    }
}
