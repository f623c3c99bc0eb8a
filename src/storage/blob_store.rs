//! Quota-managed blob store
//!
//! One file per blob plus a JSON index of entry metadata. Suited to large
//! weight shards: blobs can be read by range without loading them whole.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::storage::backend::{key_file_name, CacheBackend, EntryMeta};
use crate::storage::StorageError;

const INDEX_FILE: &str = "index.json";

pub struct BlobStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
    index: Mutex<HashMap<String, EntryMeta>>,
}

impl BlobStore {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let json = std::fs::read_to_string(&index_path)?;
            match serde_json::from_str(&json) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("Blob store index unreadable, starting empty: {}", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            root,
            quota_bytes,
            index: Mutex::new(index),
        })
    }

    fn blob_path(&self, logical_path: &str) -> PathBuf {
        self.root.join(format!("{}.bin", key_file_name(logical_path)))
    }

    async fn persist_index(&self, index: &HashMap<String, EntryMeta>) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(index)?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }

    /// Metadata of an entry whose blob is present with the recorded size
    async fn intact_meta(&self, logical_path: &str) -> Result<Option<EntryMeta>, StorageError> {
        let meta = match self.index.lock().await.get(logical_path) {
            Some(meta) => meta.clone(),
            None => return Ok(None),
        };
        match tokio::fs::metadata(self.blob_path(logical_path)).await {
            Ok(file) if file.len() == meta.size => Ok(Some(meta)),
            Ok(file) => {
                tracing::warn!(
                    "Blob for {} has {} bytes, index says {}",
                    logical_path,
                    file.len(),
                    meta.size
                );
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn check_quota(&self, index: &HashMap<String, EntryMeta>, meta: &EntryMeta) -> Result<(), StorageError> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let used: u64 = index
            .iter()
            .filter(|(path, _)| path.as_str() != meta.logical_path)
            .map(|(_, m)| m.size)
            .sum();
        if used + meta.size > quota {
            return Err(StorageError::QuotaExceeded {
                needed: meta.size,
                available: quota.saturating_sub(used),
            });
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CacheBackend for BlobStore {
    fn name(&self) -> &'static str {
        "blob_store"
    }

    async fn meta(&self, logical_path: &str) -> Result<Option<EntryMeta>, StorageError> {
        self.intact_meta(logical_path).await
    }

    async fn read(&self, logical_path: &str) -> Result<Option<(EntryMeta, Bytes)>, StorageError> {
        let Some(meta) = self.intact_meta(logical_path).await? else {
            return Ok(None);
        };
        let data = tokio::fs::read(self.blob_path(logical_path)).await?;
        if data.len() as u64 != meta.size {
            return Ok(None);
        }
        Ok(Some((meta, Bytes::from(data))))
    }

    async fn read_range(
        &self,
        logical_path: &str,
        offset: u64,
        len: u64,
    ) -> Result<Option<Bytes>, StorageError> {
        let Some(meta) = self.intact_meta(logical_path).await? else {
            return Ok(None);
        };
        if offset.saturating_add(len) > meta.size {
            return Err(StorageError::Corrupt {
                path: logical_path.to_string(),
                reason: format!(
                    "range {}..{} beyond blob of {} bytes",
                    offset,
                    offset.saturating_add(len),
                    meta.size
                ),
            });
        }
        let mut file = tokio::fs::File::open(self.blob_path(logical_path)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    async fn write(&self, meta: &EntryMeta, data: &[u8]) -> Result<(), StorageError> {
        self.check_quota(&*self.index.lock().await, meta)?;

        // The blob itself is written without holding the index lock
        let blob_path = self.blob_path(&meta.logical_path);
        let tmp_path = blob_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        let mut index = self.index.lock().await;
        // Other keys may have been stored meanwhile
        if let Err(e) = self.check_quota(&index, meta) {
            drop(index);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp_path, &blob_path).await?;
        index.insert(meta.logical_path.clone(), meta.clone());
        self.persist_index(&index).await?;
        tracing::debug!("Stored {} ({} bytes) in blob store", meta.logical_path, meta.size);
        Ok(())
    }

    async fn remove(&self, logical_path: &str) -> Result<bool, StorageError> {
        let mut index = self.index.lock().await;
        let existed = index.remove(logical_path).is_some();
        match tokio::fs::remove_file(self.blob_path(logical_path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if existed {
            self.persist_index(&index).await?;
        }
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let index = self.index.lock().await;
        let mut keys: Vec<String> = index.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn usage(&self) -> Result<u64, StorageError> {
        Ok(self.index.lock().await.values().map(|m| m.size).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quota_rejects_oversized_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), Some(8)).unwrap();

        let small = EntryMeta::for_data("m/a", b"12345");
        store.write(&small, b"12345").await.unwrap();

        let big = EntryMeta::for_data("m/b", b"123456");
        let err = store.write(&big, b"123456").await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { needed: 6, available: 3 }));

        // Replacing an entry only counts the new size
        let replacement = EntryMeta::for_data("m/a", b"12345678");
        store.write(&replacement, b"12345678").await.unwrap();
        assert_eq!(store.usage().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_writes_respect_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(BlobStore::open(dir.path(), Some(10)).unwrap());

        let tasks: Vec<_> = ["m/a", "m/b", "m/c"]
            .into_iter()
            .map(|key| {
                let store = store.clone();
                tokio::spawn(async move {
                    let meta = EntryMeta::for_data(key, b"123456");
                    store.write(&meta, b"123456").await
                })
            })
            .collect();
        let mut stored = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => stored += 1,
                Err(e) => assert!(matches!(e, StorageError::QuotaExceeded { .. })),
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(store.usage().await.unwrap(), 6);

        // Rejected writes leave no temporary files behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BlobStore::open(dir.path(), None).unwrap();
            let meta = EntryMeta::for_data("m/config", b"{}");
            store.write(&meta, b"{}").await.unwrap();
        }
        let store = BlobStore::open(dir.path(), None).unwrap();
        let meta = store.meta("m/config").await.unwrap().expect("entry persisted");
        assert_eq!(meta.size, 2);
    }

    #[tokio::test]
    async fn test_truncated_blob_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        let meta = EntryMeta::for_data("m/w", b"abcdef");
        store.write(&meta, b"abcdef").await.unwrap();

        std::fs::write(store.blob_path("m/w"), b"abc").unwrap();
        assert!(store.meta("m/w").await.unwrap().is_none());
        assert!(store.read("m/w").await.unwrap().is_none());
    }
}
