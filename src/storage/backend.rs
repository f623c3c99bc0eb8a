//! Cache backend strategy
//!
//! The artifact cache talks to storage only through [`CacheBackend`]. Two
//! implementations exist: [`BlobStore`] and [`RequestCache`]; which one is
//! used is decided once, when the cache is built.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::blob_store::BlobStore;
use crate::storage::request_cache::RequestCache;
use crate::storage::StorageError;
use crate::types::config::CacheBackendKind;

/// Metadata stored alongside every cached blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub logical_path: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the blob
    pub digest: String,
    pub stored_at: DateTime<Utc>,
}

impl EntryMeta {
    pub fn for_data(logical_path: &str, data: &[u8]) -> Self {
        Self {
            logical_path: logical_path.to_string(),
            size: data.len() as u64,
            digest: sha256_hex(data),
            stored_at: Utc::now(),
        }
    }
}

/// Storage strategy for cached artifacts.
///
/// Implementations must replace entries atomically: a reader sees either the
/// previous blob or the new one, never a mix. `meta` and `read` report an
/// entry whose stored bytes do not match its recorded size as absent.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn meta(&self, logical_path: &str) -> Result<Option<EntryMeta>, StorageError>;

    async fn read(&self, logical_path: &str) -> Result<Option<(EntryMeta, Bytes)>, StorageError>;

    /// Read `len` bytes starting at `offset` of a stored blob
    async fn read_range(
        &self,
        logical_path: &str,
        offset: u64,
        len: u64,
    ) -> Result<Option<Bytes>, StorageError> {
        let Some((_, data)) = self.read(logical_path).await? else {
            return Ok(None);
        };
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        if end > data.len() {
            return Err(StorageError::Corrupt {
                path: logical_path.to_string(),
                reason: format!("range {start}..{end} beyond blob of {} bytes", data.len()),
            });
        }
        Ok(Some(data.slice(start..end)))
    }

    async fn write(&self, meta: &EntryMeta, data: &[u8]) -> Result<(), StorageError>;

    /// Returns whether an entry was removed
    async fn remove(&self, logical_path: &str) -> Result<bool, StorageError>;

    /// Logical paths starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Total bytes held
    async fn usage(&self) -> Result<u64, StorageError>;
}

/// Build the configured backend rooted at `root`
pub fn open_backend(
    kind: CacheBackendKind,
    root: &Path,
    quota_bytes: Option<u64>,
) -> Result<Arc<dyn CacheBackend>, StorageError> {
    let backend: Arc<dyn CacheBackend> = match kind {
        CacheBackendKind::BlobStore => Arc::new(BlobStore::open(root.join("blobs"), quota_bytes)?),
        CacheBackendKind::RequestCache => Arc::new(RequestCache::open(root.join("requests"))?),
    };
    tracing::debug!("Opened {} cache backend at {:?}", backend.name(), root);
    Ok(backend)
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Stable, filesystem-safe file name for a logical path
pub(crate) fn key_file_name(logical_path: &str) -> String {
    sha256_hex(logical_path.as_bytes())
}
