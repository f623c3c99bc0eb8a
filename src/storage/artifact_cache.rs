//! Artifact cache
//!
//! Fetches model artifacts (chat config, tokenizer files, weight manifest,
//! weight shards, kernel library), verifies them, persists them through a
//! [`CacheBackend`] and serves them back on later loads.
//!
//! Concurrent requests for the same logical path share one in-flight
//! transfer. The cache never retries a failed transfer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::backend::{sha256_hex, CacheBackend, EntryMeta};
use crate::storage::fetch::{format_size, join_url, FetchError, Fetcher};
use crate::storage::manifest::{WeightManifest, MANIFEST_FILE};
use crate::storage::StorageError;
use crate::types::model::{ModelConfig, ModelRecord};
use crate::types::progress::ProgressTracker;

pub const CONFIG_FILE: &str = "mlc-chat-config.json";

const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// Category of a model artifact, used for selective eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Config,
    Tokenizer,
    /// Weight manifest plus every shard
    Weights,
    KernelLibrary,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Config,
        ArtifactKind::Tokenizer,
        ArtifactKind::Weights,
        ArtifactKind::KernelLibrary,
    ];

    fn dir(self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::Tokenizer => "tokenizer",
            ArtifactKind::Weights => "weights",
            ArtifactKind::KernelLibrary => "kernel",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactKind::Config => "config",
            ArtifactKind::Tokenizer => "tokenizer",
            ArtifactKind::Weights => "weights",
            ArtifactKind::KernelLibrary => "kernel_library",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(ArtifactKind::Config),
            "tokenizer" => Ok(ArtifactKind::Tokenizer),
            "weights" => Ok(ArtifactKind::Weights),
            "kernel_library" | "kernel" => Ok(ArtifactKind::KernelLibrary),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// Errors raised by the artifact cache
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("Network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Cache storage error: {0}")]
    Storage(String),

    #[error("Invalid artifact {path}: {reason}")]
    InvalidArtifact { path: String, reason: String },
}

impl From<StorageError> for CacheError {
    fn from(e: StorageError) -> Self {
        CacheError::Storage(e.to_string())
    }
}

impl CacheError {
    fn network(url: &str, e: FetchError) -> Self {
        CacheError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// A verified artifact
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub logical_path: String,
    pub data: Bytes,
    /// Lowercase hex SHA-256 of `data`
    pub digest: String,
    pub size: u64,
}

/// What a fetched artifact must look like; unset fields are not checked
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expected {
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

impl Expected {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn size(size: u64) -> Self {
        Self {
            size: Some(size),
            sha256: None,
        }
    }

    fn matches(&self, meta: &EntryMeta) -> bool {
        self.size.map_or(true, |size| size == meta.size)
            && self
                .sha256
                .as_deref()
                .map_or(true, |sha| sha.eq_ignore_ascii_case(&meta.digest))
    }

    fn verify(&self, logical_path: &str, size: u64, digest: &str) -> Result<(), CacheError> {
        if let Some(expected) = self.size {
            if expected != size {
                return Err(CacheError::Integrity {
                    path: logical_path.to_string(),
                    expected: format!("{expected} bytes"),
                    actual: format!("{size} bytes"),
                });
            }
        }
        if let Some(expected) = &self.sha256 {
            if !expected.eq_ignore_ascii_case(digest) {
                return Err(CacheError::Integrity {
                    path: logical_path.to_string(),
                    expected: format!("sha256 {expected}"),
                    actual: format!("sha256 {digest}"),
                });
            }
        }
        Ok(())
    }
}

/// Byte-progress callback owned by an in-flight transfer
pub type ByteProgress = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

type InflightFetch = Shared<BoxFuture<'static, Result<CacheEntry, CacheError>>>;

struct CacheInner {
    backend: Arc<dyn CacheBackend>,
    fetcher: Arc<dyn Fetcher>,
    inflight: DashMap<String, InflightFetch>,
}

/// Handle to the artifact cache; cheap to clone
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<CacheInner>,
    max_concurrent_fetches: usize,
}

impl ArtifactCache {
    pub fn new(backend: Arc<dyn CacheBackend>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                fetcher,
                inflight: DashMap::new(),
            }),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }

    /// Bound the number of shards downloaded at once
    pub fn with_fetch_concurrency(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max.max(1);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Total bytes held by the backend
    pub async fn usage(&self) -> Result<u64, CacheError> {
        Ok(self.inner.backend.usage().await?)
    }

    /// Return the cached artifact, or download, verify and store it
    pub async fn fetch_and_cache(
        &self,
        logical_path: &str,
        source_url: &str,
        expected: &Expected,
    ) -> Result<CacheEntry, CacheError> {
        self.fetch_with_progress(logical_path, source_url, expected, None).await
    }

    async fn fetch_with_progress(
        &self,
        logical_path: &str,
        source_url: &str,
        expected: &Expected,
        progress: Option<ByteProgress>,
    ) -> Result<CacheEntry, CacheError> {
        let fetch = match self.inner.inflight.entry(logical_path.to_string()) {
            Entry::Occupied(entry) => {
                tracing::debug!("Joining in-flight fetch of {}", logical_path);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let inner = self.inner.clone();
                let path = logical_path.to_string();
                let url = source_url.to_string();
                let expected = expected.clone();
                let fetch = async move {
                    let result = inner.load_or_fetch(&path, &url, &expected, progress).await;
                    inner.inflight.remove(&path);
                    result
                }
                .boxed()
                .shared();
                entry.insert(fetch.clone());
                fetch
            }
        };
        // The leader verified against its own expectation, not necessarily ours
        let entry = fetch.await?;
        expected.verify(logical_path, entry.size, &entry.digest)?;
        Ok(entry)
    }

    /// Read an artifact already in the cache
    pub async fn read(&self, logical_path: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .inner
            .backend
            .read(logical_path)
            .await?
            .map(|(meta, data)| CacheEntry {
                logical_path: meta.logical_path,
                data,
                digest: meta.digest,
                size: meta.size,
            }))
    }

    /// Whether every artifact of the model is present and intact
    pub async fn has(&self, record: &ModelRecord) -> Result<bool, CacheError> {
        let backend = &self.inner.backend;

        let Some((_, config_data)) = backend.read(&config_path(record)).await? else {
            return Ok(false);
        };
        let Ok(config) = serde_json::from_slice::<ModelConfig>(&config_data) else {
            return Ok(false);
        };
        for file in &config.tokenizer_files {
            if backend.meta(&tokenizer_path(record, file)).await?.is_none() {
                return Ok(false);
            }
        }

        let Some((_, manifest_data)) = backend.read(&manifest_path(record)).await? else {
            return Ok(false);
        };
        let Ok(manifest) = WeightManifest::parse(&manifest_data) else {
            return Ok(false);
        };
        for shard in &manifest.records {
            match backend.meta(&shard_path(record, &shard.data_path)).await? {
                Some(meta) if meta.size == shard.nbytes => {}
                _ => return Ok(false),
            }
        }

        Ok(backend.meta(&kernel_path(record)).await?.is_some())
    }

    /// Remove every artifact of the model. Idempotent.
    pub async fn delete_all(&self, record: &ModelRecord) -> Result<usize, CacheError> {
        self.delete_prefix(&format!("{}/", record.model_id)).await
    }

    /// Remove one category of artifacts of the model. Idempotent.
    pub async fn delete_artifact(&self, record: &ModelRecord, kind: ArtifactKind) -> Result<usize, CacheError> {
        self.delete_prefix(&format!("{}/{}/", record.model_id, kind.dir())).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let backend = &self.inner.backend;
        let mut removed = 0;
        for key in backend.keys(prefix).await? {
            if backend.remove(&key).await? {
                removed += 1;
            }
        }
        tracing::info!("Removed {} cached artifacts under {}", removed, prefix);
        Ok(removed)
    }

    /// Fetch every artifact a model needs, reporting progress along the way
    pub async fn fetch_model(
        &self,
        record: &ModelRecord,
        progress: &ProgressTracker,
    ) -> Result<ModelArtifacts, CacheError> {
        let base = &record.model_url;
        progress.report(0.0, format!("Start to fetch params for {}", record.model_id));

        let config_entry = self
            .fetch_and_cache(&config_path(record), &join_url(base, CONFIG_FILE), &Expected::none())
            .await?;
        let config: ModelConfig =
            serde_json::from_slice(&config_entry.data).map_err(|e| CacheError::InvalidArtifact {
                path: config_entry.logical_path.clone(),
                reason: e.to_string(),
            })?;

        let mut tokenizer_files = Vec::with_capacity(config.tokenizer_files.len());
        for file in &config.tokenizer_files {
            let entry = self
                .fetch_and_cache(&tokenizer_path(record, file), &join_url(base, file), &Expected::none())
                .await?;
            tokenizer_files.push((file.clone(), entry.data));
        }

        let manifest_entry = self
            .fetch_and_cache(&manifest_path(record), &join_url(base, MANIFEST_FILE), &Expected::none())
            .await?;
        let manifest = WeightManifest::parse(&manifest_entry.data).map_err(|reason| CacheError::InvalidArtifact {
            path: manifest_entry.logical_path.clone(),
            reason,
        })?;
        progress.report(0.05, "Fetched config, tokenizer and weight manifest");

        self.fetch_shards(record, &manifest, &progress.span(0.05, 0.95)).await?;

        let kernel_entry = self
            .fetch_and_cache(&kernel_path(record), &record.model_lib, &Expected::none())
            .await?;
        progress.report(1.0, format!("Finish loading params for {}", record.model_id));

        Ok(ModelArtifacts {
            record: record.clone(),
            config,
            tokenizer_files,
            manifest,
            kernel_library: kernel_entry.data,
            cache: self.clone(),
        })
    }

    async fn fetch_shards(
        &self,
        record: &ModelRecord,
        manifest: &WeightManifest,
        progress: &ProgressTracker,
    ) -> Result<(), CacheError> {
        let total_bytes = manifest.total_bytes();
        let total_shards = manifest.records.len();
        let fetched = Arc::new(AtomicU64::new(0));
        let shards_done = Arc::new(AtomicU64::new(0));

        let shard_fetches: Vec<_> = manifest
            .records
            .iter()
            .map(|shard| {
                let fetched = fetched.clone();
                let shards_done = shards_done.clone();
                let tracker = progress.clone();
                let seen = Arc::new(AtomicU64::new(0));
                let on_bytes: ByteProgress = {
                    let fetched = fetched.clone();
                    let shards_done = shards_done.clone();
                    let tracker = tracker.clone();
                    let seen = seen.clone();
                    Arc::new(move |downloaded: u64, _total: Option<u64>| {
                        let delta = downloaded.saturating_sub(seen.swap(downloaded, Ordering::SeqCst));
                        let now = fetched.fetch_add(delta, Ordering::SeqCst) + delta;
                        report_shard_progress(&tracker, now, total_bytes, shards_done.load(Ordering::SeqCst), total_shards);
                    })
                };
                let expected = Expected {
                    size: Some(shard.nbytes),
                    sha256: shard.sha256.clone(),
                };
                let path = shard_path(record, &shard.data_path);
                let url = join_url(&record.model_url, &shard.data_path);
                async move {
                    let entry = self.fetch_with_progress(&path, &url, &expected, Some(on_bytes)).await?;
                    let done = shards_done.fetch_add(1, Ordering::SeqCst) + 1;
                    // Cache hits and joined transfers never report bytes here
                    let unreported = entry.size.saturating_sub(seen.load(Ordering::SeqCst));
                    let now = fetched.fetch_add(unreported, Ordering::SeqCst) + unreported;
                    report_shard_progress(&tracker, now, total_bytes, done, total_shards);
                    Ok::<_, CacheError>(())
                }
            })
            .collect();
        futures::stream::iter(shard_fetches)
            .buffer_unordered(self.max_concurrent_fetches)
            .try_collect::<Vec<()>>()
            .await?;

        tracing::info!(
            "Weights for {} ready: {} shards, {}",
            record.model_id,
            total_shards,
            format_size(total_bytes)
        );
        Ok(())
    }
}

fn report_shard_progress(tracker: &ProgressTracker, fetched: u64, total: u64, done: u64, shards: usize) {
    let fraction = if total == 0 {
        done as f64 / shards.max(1) as f64
    } else {
        (fetched as f64 / total as f64).min(1.0)
    };
    tracker.report(
        fraction,
        format!(
            "Fetching param cache[{}/{}]: {}MB fetched. {}% completed, {} secs elapsed.",
            done,
            shards,
            fetched / (1024 * 1024),
            (fraction * 100.0).round() as u32,
            tracker.elapsed_secs().round() as u64,
        ),
    );
}

impl CacheInner {
    async fn load_or_fetch(
        &self,
        logical_path: &str,
        source_url: &str,
        expected: &Expected,
        progress: Option<ByteProgress>,
    ) -> Result<CacheEntry, CacheError> {
        if let Some((meta, data)) = self.backend.read(logical_path).await? {
            let digest = sha256_hex(&data);
            if digest != meta.digest {
                tracing::warn!(
                    "Cached bytes of {} no longer match their digest, fetching again",
                    logical_path
                );
            } else if expected.matches(&meta) {
                tracing::debug!("Cache hit for {}", logical_path);
                return Ok(CacheEntry {
                    logical_path: meta.logical_path,
                    data,
                    digest,
                    size: meta.size,
                });
            } else {
                tracing::warn!("Stale cache entry for {}, fetching again", logical_path);
            }
        }

        let data = match &progress {
            Some(progress) => self.fetcher.fetch(source_url, progress.as_ref()).await,
            None => self.fetcher.fetch(source_url, &|_, _| {}).await,
        }
        .map_err(|e| CacheError::network(source_url, e))?;

        let digest = sha256_hex(&data);
        let size = data.len() as u64;
        expected.verify(logical_path, size, &digest)?;

        let meta = EntryMeta {
            logical_path: logical_path.to_string(),
            size,
            digest: digest.clone(),
            stored_at: chrono::Utc::now(),
        };
        self.backend.write(&meta, &data).await?;
        tracing::debug!("Cached {} ({})", logical_path, format_size(size));

        Ok(CacheEntry {
            logical_path: logical_path.to_string(),
            data,
            digest,
            size,
        })
    }
}

/// Everything a runtime loader needs to bring a model up.
///
/// Weight shards are not held in memory; they are read back from the cache
/// on demand.
pub struct ModelArtifacts {
    pub record: ModelRecord,
    pub config: ModelConfig,
    /// `(file name, contents)` in the order the chat config lists them
    pub tokenizer_files: Vec<(String, Bytes)>,
    pub manifest: WeightManifest,
    pub kernel_library: Bytes,
    cache: ArtifactCache,
}

impl ModelArtifacts {
    pub fn tokenizer_file(&self, name: &str) -> Option<&Bytes> {
        self.tokenizer_files.iter().find(|(file, _)| file == name).map(|(_, data)| data)
    }

    /// Full contents of shard `index`
    pub async fn shard(&self, index: usize) -> Result<Bytes, CacheError> {
        let shard = self.manifest.records.get(index).ok_or_else(|| CacheError::InvalidArtifact {
            path: manifest_path(&self.record),
            reason: format!("no shard {index}"),
        })?;
        let path = shard_path(&self.record, &shard.data_path);
        match self.cache.read(&path).await? {
            Some(entry) => Ok(entry.data),
            None => Err(CacheError::InvalidArtifact {
                path,
                reason: "missing from cache".to_string(),
            }),
        }
    }

    /// Bytes of one parameter, read by range from its shard
    pub async fn param(&self, name: &str) -> Result<Bytes, CacheError> {
        let location = self.manifest.locate(name).ok_or_else(|| CacheError::InvalidArtifact {
            path: manifest_path(&self.record),
            reason: format!("unknown parameter {name}"),
        })?;
        let path = shard_path(&self.record, &location.shard.data_path);
        self.cache
            .inner
            .backend
            .read_range(&path, location.param.byte_offset, location.param.nbytes)
            .await?
            .ok_or_else(|| CacheError::InvalidArtifact {
                path,
                reason: "missing from cache".to_string(),
            })
    }
}

pub fn config_path(record: &ModelRecord) -> String {
    format!("{}/config/{}", record.model_id, CONFIG_FILE)
}

pub fn tokenizer_path(record: &ModelRecord, file: &str) -> String {
    format!("{}/tokenizer/{}", record.model_id, file)
}

pub fn manifest_path(record: &ModelRecord) -> String {
    format!("{}/weights/{}", record.model_id, MANIFEST_FILE)
}

pub fn shard_path(record: &ModelRecord, data_path: &str) -> String {
    format!("{}/weights/{}", record.model_id, data_path)
}

pub fn kernel_path(record: &ModelRecord) -> String {
    format!("{}/kernel/{}", record.model_id, record.model_lib_file())
}
