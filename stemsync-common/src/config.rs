//! Bootstrap configuration and root folder resolution
//!
//! Settings sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (`STEMSYNC_ROOT_FOLDER`)
//! 3. TOML configuration file (`~/.config/stemsync/stemsync.toml`)
//! 4. Compiled defaults
//!
//! A missing or unparsable TOML file never stops startup: a warning is logged
//! and the compiled defaults are used instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "STEMSYNC_ROOT_FOLDER";

/// File name of the bootstrap configuration
pub const CONFIG_FILE_NAME: &str = "stemsync.toml";

/// Name of the cache directory below the root folder
pub const OUTPUTS_DIR_NAME: &str = "outputs";

/// Name of the upload staging directory below the root folder
pub const UPLOADS_DIR_NAME: &str = "uploads";

/// Bootstrap configuration loaded from TOML
///
/// Read once at startup; the service must restart to pick up changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the cache and upload directories
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Separation engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted upload, in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are removed by the reaper
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Seconds between reaper passes
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Which separation backend the engine factory builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackendKind {
    /// External separation runner process
    #[default]
    Command,
    /// Fabricated results, no model (interface testing)
    Synthetic,
}

/// Separation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: EngineBackendKind,

    /// Program used to run the separation model
    #[serde(default = "default_runner")]
    pub runner: String,

    /// Arguments placed before the per-job arguments
    #[serde(default = "default_runner_args")]
    pub runner_args: Vec<String>,

    /// Modes whose engines are constructed at startup
    #[serde(default)]
    pub preload: Vec<String>,

    /// Idle interval between keepalive frames on a progress stream
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackendKind::default(),
            runner: default_runner(),
            runner_args: default_runner_args(),
            preload: Vec::new(),
            keepalive_ms: default_keepalive_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_upload_mb() -> usize {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_reap_interval_secs() -> u64 {
    3600
}

fn default_runner() -> String {
    "python3".to_string()
}

fn default_runner_args() -> Vec<String> {
    vec!["scripts/separate.py".to_string()]
}

fn default_keepalive_ms() -> u64 {
    100
}

/// Compiled defaults used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
}

impl CompiledDefaults {
    /// Defaults for the platform this binary was built for
    pub fn for_current_platform() -> Self {
        let root_folder = dirs::data_local_dir()
            .map(|d| d.join("stemsync"))
            .unwrap_or_else(|| std::env::temp_dir().join("stemsync"));

        Self {
            root_folder,
            log_level: default_log_level(),
        }
    }
}

/// Default location of the bootstrap file (`<config dir>/stemsync/stemsync.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("stemsync").join(CONFIG_FILE_NAME))
}

/// Parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load the bootstrap configuration, falling back to defaults
///
/// An explicit path that cannot be read is reported as a warning, same as a
/// broken default file. Absence of the default file is not worth a warning.
pub fn load_or_default(explicit: Option<&Path>) -> TomlConfig {
    let (path, explicit_path) = match explicit {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return TomlConfig::default(),
        },
    };

    if !explicit_path && !path.exists() {
        return TomlConfig::default();
    }

    match load_toml_config(&path) {
        Ok(config) => {
            info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            warn!("{}; using compiled defaults", e);
            TomlConfig::default()
        }
    }
}

/// Write a TOML configuration file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Resolves the root folder from CLI, environment, TOML and defaults
#[derive(Debug, Default, Clone)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    pub fn with_toml(mut self, toml_value: Option<PathBuf>) -> Self {
        self.toml_value = toml_value;
        self
    }

    /// Resolve following CLI → ENV → TOML → compiled default
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Creates the root folder and its working directories
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Directory holding cached separation results
    pub fn outputs_dir(&self) -> PathBuf {
        self.root_folder.join(OUTPUTS_DIR_NAME)
    }

    /// Directory holding uploads while their job runs
    pub fn uploads_dir(&self) -> PathBuf {
        self.root_folder.join(UPLOADS_DIR_NAME)
    }

    /// Create root, outputs and uploads directories if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        for dir in [
            self.root_folder.clone(),
            self.outputs_dir(),
            self.uploads_dir(),
        ] {
            if !dir.exists() {
                info!("Creating directory: {}", dir.display());
            }
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
