//! Settings storage
//!
//! Manages persistence of engine settings and loading of the app config.

use crate::storage::{get_data_dir, StorageError};
use crate::types::config::{AppConfig, CacheBackendKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Storage strategy for model artifacts
    #[serde(default)]
    pub cache_backend: CacheBackendKind,
    /// Directory holding cached artifacts
    pub cache_dir: PathBuf,
    /// Byte quota for the blob store (`None` = unlimited)
    #[serde(default)]
    pub cache_quota_bytes: Option<u64>,
    /// JSON file listing loadable models
    pub app_config_path: PathBuf,
    /// Weight shards downloaded concurrently
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Per-request download timeout
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// Default `tracing` filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_download_timeout() -> u64 {
    3600 // 1 hour for large shards
}

fn default_log_filter() -> String {
    "webllm=info".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        let data_dir = get_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            cache_backend: CacheBackendKind::default(),
            cache_dir: data_dir.join("cache"),
            cache_quota_bytes: None,
            app_config_path: data_dir.join("app-config.json"),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            download_timeout_secs: default_download_timeout(),
            log_filter: default_log_filter(),
        }
    }
}

impl EngineSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.max_concurrent_fetches = self.max_concurrent_fetches.clamp(1, 32);
        self.download_timeout_secs = self.download_timeout_secs.clamp(10, 24 * 3600);

        if self.cache_quota_bytes == Some(0) {
            self.cache_quota_bytes = None;
        }

        if self.log_filter.trim().is_empty() {
            self.log_filter = default_log_filter();
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Settings loading with error propagation
pub fn load_settings_from(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}

/// Load the model list
///
/// A missing file yields an empty config
pub fn load_app_config(path: &Path) -> Result<AppConfig, StorageError> {
    if !path.exists() {
        tracing::info!("App config {:?} not found, no models listed", path);
        return Ok(AppConfig::default());
    }
    let json = fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&json)?;
    tracing::debug!("Loaded {} model records", config.model_list.len());
    Ok(config)
}
