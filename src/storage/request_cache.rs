//! Request/response cache
//!
//! Each entry is a single file holding a one-line JSON header (the entry
//! metadata) followed by the body, the way an HTTP response cache keys a
//! response by request URL. No quota is enforced here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::storage::backend::{key_file_name, CacheBackend, EntryMeta};
use crate::storage::StorageError;

const ENTRY_EXT: &str = "entry";

pub struct RequestCache {
    root: PathBuf,
}

impl RequestCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, logical_path: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", key_file_name(logical_path), ENTRY_EXT))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Split a stored entry into header and body, checking the body length
    fn split_entry(raw: Vec<u8>) -> Option<(EntryMeta, Bytes)> {
        let newline = raw.iter().position(|b| *b == b'\n')?;
        let meta: EntryMeta = serde_json::from_slice(&raw[..newline]).ok()?;
        let raw = Bytes::from(raw);
        let body = raw.slice(newline + 1..);
        if body.len() as u64 != meta.size {
            tracing::warn!(
                "Cached response for {} has {} bytes, header says {}",
                meta.logical_path,
                body.len(),
                meta.size
            );
            return None;
        }
        Some((meta, body))
    }

    async fn read_entry(path: &Path) -> Result<Option<(EntryMeta, Bytes)>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Self::split_entry(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse only the header line, checking the file length against it
    async fn read_header(path: &Path) -> Result<Option<EntryMeta>, StorageError> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();

        let mut line = Vec::new();
        BufReader::new(file).read_until(b'\n', &mut line).await?;
        if line.pop() != Some(b'\n') {
            return Ok(None);
        }
        let Ok(meta) = serde_json::from_slice::<EntryMeta>(&line) else {
            return Ok(None);
        };
        let body_len = file_len.saturating_sub(line.len() as u64 + 1);
        if body_len != meta.size {
            tracing::warn!(
                "Cached response for {} has {} bytes, header says {}",
                meta.logical_path,
                body_len,
                meta.size
            );
            return Ok(None);
        }
        Ok(Some(meta))
    }

    /// Headers of every intact entry
    async fn scan(&self) -> Result<Vec<EntryMeta>, StorageError> {
        let mut metas = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Some(meta) = Self::read_header(&path).await? {
                metas.push(meta);
            }
        }
        Ok(metas)
    }
}

#[async_trait]
impl CacheBackend for RequestCache {
    fn name(&self) -> &'static str {
        "request_cache"
    }

    async fn meta(&self, logical_path: &str) -> Result<Option<EntryMeta>, StorageError> {
        let meta = Self::read_header(&self.entry_path(logical_path)).await?;
        Ok(meta.filter(|meta| meta.logical_path == logical_path))
    }

    async fn read(&self, logical_path: &str) -> Result<Option<(EntryMeta, Bytes)>, StorageError> {
        let entry = Self::read_entry(&self.entry_path(logical_path)).await?;
        // Guard against a hash collision between logical paths
        Ok(entry.filter(|(meta, _)| meta.logical_path == logical_path))
    }

    async fn write(&self, meta: &EntryMeta, data: &[u8]) -> Result<(), StorageError> {
        let header = serde_json::to_vec(meta)?;
        let path = self.entry_path(&meta.logical_path);
        let tmp_path = path.with_extension(format!("{ENTRY_EXT}.tmp"));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&header).await?;
        file.write_all(b"\n").await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!("Stored {} ({} bytes) in request cache", meta.logical_path, meta.size);
        Ok(())
    }

    async fn remove(&self, logical_path: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.entry_path(logical_path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .scan()
            .await?
            .into_iter()
            .map(|meta| meta.logical_path)
            .filter(|path| path.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn usage(&self) -> Result<u64, StorageError> {
        Ok(self.scan().await?.iter().map(|meta| meta.size).sum())
    }
}
