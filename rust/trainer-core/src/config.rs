// rust/trainer-core/src/config.rs

//! Configuration for checkpointing and early stopping.
//!
//! Configuration is read from TOML, optionally overridden by `TRAINER_`
//! environment variables, and validated before use.
//!
//! ```toml
//! [storage]
//! base_path = "/mnt/runs/resnet"
//!
//! [checkpoint]
//! weights_save_path = "hpc"
//! compression = "zstd"
//!
//! [early_stopping]
//! monitor = "val_loss"
//! patience = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TrainerError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
    pub early_stopping: StoppingConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Root for all relative checkpoint paths.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to memory-map large checkpoints when reading them.
    pub use_mmap: bool,
    // File size threshold (bytes) above which reads are memory-mapped.
    pub mmap_threshold: u64,
}

/// Checkpoint and preemption snapshot options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory scanned for preemption snapshots on start-up and written to
    /// when the job is preempted.
    pub weights_save_path: PathBuf,
    /// Payload compression: "none", "lz4", or "zstd".
    pub compression: String,
    /// Compression level (zstd only).
    pub compression_level: i32,
    /// Filename prefix of preemption snapshots (`<prefix>_<N>.<extension>`).
    pub preemption_prefix: String,
    /// Filename extension of preemption snapshots, without the dot.
    pub extension: String,
}

/// Early stopping options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingConfig {
    /// Metric key to watch.
    pub monitor: String,
    /// Minimum change that counts as an improvement.
    pub min_delta: f64,
    /// Consecutive non-improving cycles tolerated before stopping.
    pub patience: u32,
    /// "auto", "min" or "max". Unknown values fall back to "auto".
    pub mode: String,
    /// Fail when the monitored metric is missing instead of skipping the cycle.
    pub strict: bool,
    /// Log mode resolution and missing-metric warnings.
    pub verbose: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            weights_save_path: PathBuf::from("."),
            compression: "none".to_string(),
            compression_level: 3,
            preemption_prefix: "hpc_ckpt".to_string(),
            extension: "ckpt".to_string(),
        }
    }
}

impl Default for StoppingConfig {
    fn default() -> Self {
        Self {
            monitor: "early_stop_on".to_string(),
            min_delta: 0.0,
            patience: 3,
            mode: "auto".to_string(),
            strict: true,
            verbose: false,
        }
    }
}

impl StoppingConfig {
    /// Shorthand for watching `monitor` with otherwise default settings.
    pub fn monitoring(monitor: impl Into<String>) -> Self {
        Self {
            monitor: monitor.into(),
            ..Default::default()
        }
    }
}

impl FromStr for TrainerConfig {
    type Err = TrainerError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| TrainerError::config_with_source("failed to parse TOML config", e))
    }
}

impl TrainerConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainerError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables use the `TRAINER_` prefix followed by the section and field:
    // - `TRAINER_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `TRAINER_CHECKPOINT_WEIGHTS_SAVE_PATH` overrides `checkpoint.weights_save_path`
    // - `TRAINER_CHECKPOINT_COMPRESSION` overrides `checkpoint.compression`
    // - `TRAINER_EARLY_STOPPING_PATIENCE` overrides `early_stopping.patience`
    //
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("TRAINER_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TRAINER_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("TRAINER_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("TRAINER_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("TRAINER_CHECKPOINT_WEIGHTS_SAVE_PATH") {
            self.checkpoint.weights_save_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TRAINER_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Ok(val) = std::env::var("TRAINER_CHECKPOINT_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.checkpoint.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("TRAINER_CHECKPOINT_PREEMPTION_PREFIX") {
            self.checkpoint.preemption_prefix = val;
        }

        // Early stopping overrides
        if let Ok(val) = std::env::var("TRAINER_EARLY_STOPPING_MONITOR") {
            self.early_stopping.monitor = val;
        }
        if let Ok(val) = std::env::var("TRAINER_EARLY_STOPPING_MIN_DELTA") {
            if let Ok(v) = val.parse() {
                self.early_stopping.min_delta = v;
            }
        }
        if let Ok(val) = std::env::var("TRAINER_EARLY_STOPPING_PATIENCE") {
            if let Ok(v) = val.parse() {
                self.early_stopping.patience = v;
            }
        }
        if let Ok(val) = std::env::var("TRAINER_EARLY_STOPPING_MODE") {
            self.early_stopping.mode = val;
        }
        if let Ok(val) = std::env::var("TRAINER_EARLY_STOPPING_STRICT") {
            if let Ok(v) = val.parse() {
                self.early_stopping.strict = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // An unknown early stopping mode is not an error here: the monitor
    // falls back to "auto" and warns.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(TrainerError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(TrainerError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }

        let prefix = &self.checkpoint.preemption_prefix;
        if prefix.is_empty() || prefix.contains(['/', '\\']) {
            return Err(TrainerError::config(
                "checkpoint.preemption_prefix must be a non-empty file name prefix",
            ));
        }
        if self.checkpoint.extension.is_empty() || self.checkpoint.extension.starts_with('.') {
            return Err(TrainerError::config(
                "checkpoint.extension must be non-empty and given without a leading dot",
            ));
        }

        if self.early_stopping.monitor.is_empty() {
            return Err(TrainerError::config(
                "early_stopping.monitor must not be empty",
            ));
        }
        if !self.early_stopping.min_delta.is_finite() {
            return Err(TrainerError::config(
                "early_stopping.min_delta must be a finite number",
            ));
        }

        Ok(())
    }
}
