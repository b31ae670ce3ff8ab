//! Runtime configuration
//!
//! Loaded from a JSON file when present; every field has a default so a
//! partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::MB;
use crate::device::ScoringThresholds;
use crate::download::DownloadOptions;
use crate::generation::{GenerationOptions, DEFAULT_MAX_TOKENS, DEFAULT_PUBLISH_EVERY};

const APP_DIR: &str = "pocket-llm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Where model artifacts are stored
    pub models_dir: PathBuf,
    /// SQLite file holding the selection and completed downloads
    pub database_path: PathBuf,
    pub max_tokens: usize,
    pub publish_every: usize,
    pub system_reserve_mb: u64,
    pub safety_margin_mb: u64,
    /// Free space required beyond the artifact size
    pub disk_buffer_mb: u64,
    pub verify_disk_space: bool,
    pub download_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            models_dir: base.join("models"),
            database_path: base.join("pocket-llm.db"),
            max_tokens: DEFAULT_MAX_TOKENS,
            publish_every: DEFAULT_PUBLISH_EVERY,
            system_reserve_mb: 2000,
            safety_margin_mb: 1000,
            disk_buffer_mb: 100,
            verify_disk_space: true,
            download_timeout_secs: 3600, // 1 hour for the larger models
        }
    }
}

impl RuntimeConfig {
    /// Read the config at `path`, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: RuntimeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write config file {:?}", path))
    }

    pub fn thresholds(&self) -> ScoringThresholds {
        ScoringThresholds {
            system_reserve_bytes: self.system_reserve_mb * MB,
            safety_margin_bytes: self.safety_margin_mb * MB,
        }
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            disk_buffer_bytes: self.disk_buffer_mb * MB,
            verify_disk_space: self.verify_disk_space,
        }
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens,
            publish_every: self.publish_every.max(1),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
