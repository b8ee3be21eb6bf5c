//! Pool configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RUNCHART_CONFIG or --config)
//! 3. Environment variables

use crate::error::PoolError;
use crate::store::{FileStore, MachineStore, MemoryStore};
use runchart_core::RunnerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runner pool configuration.
    pub pool: PoolConfig,
    /// Machine store configuration.
    pub storage: StorageConfig,
    /// Options applied to every pooled runner.
    pub runner: RunnerOptions,
}

impl Config {
    /// Loads configuration from the file named by RUNCHART_CONFIG, if set,
    /// then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RUNCHART_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Loads configuration from an optional file, then applies environment
    /// variable overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.pool.apply_env_overrides();
        self.storage.apply_env_overrides();
        apply_runner_overrides(&mut self.runner);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pool.capacity must be at least 1".to_string(),
            ));
        }
        if self.runner.max_trigger_depth == 0 {
            return Err(ConfigError::ValidationError(
                "runner.max_trigger_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Runner pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of runners.
    pub capacity: usize,
    /// Write a machine to the store whenever its runner is released.
    pub flush_on_release: bool,
    /// Write a machine to the store after every committed transition.
    pub autosave: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            flush_on_release: true,
            autosave: true,
        }
    }
}

impl PoolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("RUNCHART_POOL_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.capacity = n;
            }
        }

        if let Ok(flush) = std::env::var("RUNCHART_FLUSH_ON_RELEASE") {
            self.flush_on_release = parse_flag(&flush);
        }

        if let Ok(autosave) = std::env::var("RUNCHART_AUTOSAVE") {
            self.autosave = parse_flag(&autosave);
        }
    }
}

/// Store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Lost on exit.
    Memory,
    /// One file per machine under `data_dir`.
    #[default]
    File,
}

/// Machine store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory of the file backend.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("RUNCHART_STORAGE_BACKEND") {
            match backend.to_lowercase().as_str() {
                "memory" => self.backend = StorageBackend::Memory,
                "file" => self.backend = StorageBackend::File,
                other => tracing::warn!("Ignoring unknown storage backend '{}'", other),
            }
        }

        if let Ok(dir) = std::env::var("RUNCHART_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Returns the directory holding machine files.
    pub fn machines_dir(&self) -> PathBuf {
        self.data_dir.join("machines")
    }

    /// Opens the configured store.
    pub fn open(&self) -> Result<Arc<dyn MachineStore>, PoolError> {
        Ok(match self.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::File => Arc::new(FileStore::open(self.machines_dir())?),
        })
    }
}

fn apply_runner_overrides(options: &mut RunnerOptions) {
    if let Ok(depth) = std::env::var("RUNCHART_MAX_TRIGGER_DEPTH") {
        if let Ok(n) = depth.parse() {
            options.max_trigger_depth = n;
        }
    }

    if let Ok(detect) = std::env::var("RUNCHART_DETECT_TRIGGER_CYCLES") {
        options.detect_trigger_cycles = parse_flag(&detect);
    }

    if let Ok(verify) = std::env::var("RUNCHART_VERIFY_CALLBACKS") {
        options.verify_callbacks_on_load = parse_flag(&verify);
    }

    if let Ok(merge) = std::env::var("RUNCHART_MERGE_PAYLOAD") {
        options.merge_payload = parse_flag(&merge);
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
