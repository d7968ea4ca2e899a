/// Configuration module for audio-embed.
///
/// Handles loading, validating, and providing default configuration values,
/// and converts them into [`PoolSettings`] for the worker pool.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::InferenceOptions;
use crate::pool::{DEFAULT_MODEL_PATH, PoolSettings};

// ── Default value functions ──────────────────────────────────────────

fn default_model_path() -> String {
    DEFAULT_MODEL_PATH.to_string()
}

fn default_max_instances() -> usize {
    10
}

fn default_admission_limit() -> usize {
    10
}

fn default_max_backlog() -> usize {
    256
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_resample_quality() -> u8 {
    4
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_model_path")]
    pub model_path: String,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    /// Pool capacity: number of engine contexts kept loaded.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Concurrent requests admitted past submission.
    #[serde(default = "default_admission_limit")]
    pub admission_limit: usize,

    /// Aggregate executions before every context is recreated.
    /// Defaults to four per instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recycle_after: Option<u64>,

    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_resample_quality")]
    pub resample_quality: u8,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            pool: PoolConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            admission_limit: default_admission_limit(),
            recycle_after: None,
            max_backlog: default_max_backlog(),
            acquire_timeout_secs: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            resample_quality: default_resample_quality(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl PoolConfig {
    /// Recycle threshold, falling back to four executions per instance.
    #[must_use]
    pub fn recycle_threshold(&self) -> u64 {
        self.recycle_after
            .unwrap_or(self.max_instances as u64 * 4)
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and optionally
    /// generates a template file.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            // Generate template only for the default path
            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.model_path.is_empty(), "model_path must be set");
        anyhow::ensure!(
            self.pool.max_instances > 0,
            "pool.max_instances must be positive"
        );
        anyhow::ensure!(
            self.pool.admission_limit > 0,
            "pool.admission_limit must be positive"
        );
        anyhow::ensure!(
            self.pool.recycle_threshold() > 0,
            "pool.recycle_after must be positive"
        );
        anyhow::ensure!(
            self.pool.max_backlog >= self.pool.admission_limit,
            "pool.max_backlog must be at least pool.admission_limit"
        );
        anyhow::ensure!(
            self.inference.sample_rate > 0,
            "inference.sample_rate must be positive"
        );
        Ok(())
    }

    /// Build the worker pool settings described by this config.
    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            capacity: self.pool.max_instances,
            admission_limit: self.pool.admission_limit,
            recycle_threshold: self.pool.recycle_threshold(),
            max_backlog: self.pool.max_backlog,
            acquire_timeout: self.pool.acquire_timeout_secs.map(Duration::from_secs),
            model_path: PathBuf::from(&self.model_path),
            inference: InferenceOptions {
                sample_rate: self.inference.sample_rate,
                resample_quality: self.inference.resample_quality,
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
