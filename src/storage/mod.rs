//! Persistent storage
//!
//! This module handles all data persistence: model artifacts (behind two
//! interchangeable cache backends) and engine settings.

pub mod artifact_cache;
pub mod backend;
pub mod blob_store;
pub mod fetch;
pub mod manifest;
pub mod request_cache;
pub mod settings;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine the data directory")]
    NoDataDir,

    #[error("Storage quota exceeded: {needed} bytes needed, {available} bytes available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Corrupt cache entry {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Platform data directory for the engine (settings, default cache location)
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("ai", "webllm", "webllm")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
