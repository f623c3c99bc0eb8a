//! Artifact downloader
//!
//! Downloads model artifacts over HTTP. The artifact cache only sees the
//! [`Fetcher`] trait so tests can serve artifacts from memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while downloading
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Request to {url} failed with status: {status}")]
    Status { url: String, status: u16 },

    #[error("Download of {url} incomplete: got {got} bytes, expected {expected}")]
    Incomplete { url: String, got: u64, expected: u64 },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl FetchError {
    pub fn url(&self) -> Option<&str> {
        match self {
            FetchError::Client(_) => None,
            FetchError::Request { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::Incomplete { url, .. }
            | FetchError::NotFound(url) => Some(url),
        }
    }
}

/// Upper bound on the buffer reserved up front from a Content-Length header
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Receives `(downloaded, total)` byte counts while a transfer runs
pub type FetchProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, progress: FetchProgress<'_>) -> Result<Bytes, FetchError>;
}

/// Fetcher backed by reqwest
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("webllm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, progress: FetchProgress<'_>) -> Result<Bytes, FetchError> {
        tracing::info!("Downloading from: {}", url);
        let request_error = |e: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let mut response = self.client.get(url).send().await.map_err(request_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            tracing::debug!("File size: {} ({})", total, format_size(total));
        }

        let mut body = BytesMut::with_capacity(initial_capacity(total_size));
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            body.extend_from_slice(&chunk);
            downloaded += chunk.len() as u64;
            progress(downloaded, total_size);
        }

        if let Some(expected) = total_size {
            if downloaded != expected {
                return Err(FetchError::Incomplete {
                    url: url.to_string(),
                    got: downloaded,
                    expected,
                });
            }
        }

        tracing::debug!("Download complete: {} ({})", url, format_size(downloaded));
        Ok(body.freeze())
    }
}

fn initial_capacity(content_length: Option<u64>) -> usize {
    content_length.unwrap_or(0).min(MAX_PREALLOC) as usize
}

/// In-memory fetcher for tests and offline use.
///
/// Counts transfers so callers can assert that deduplication worked.
#[derive(Default)]
pub struct StaticFetcher {
    files: RwLock<HashMap<String, Bytes>>,
    transfers: AtomicUsize,
    delay: Option<Duration>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every transfer, widening race windows in concurrency tests
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        let mut files = match self.files.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        files.insert(url.into(), data.into());
    }

    /// Number of completed or failed transfers so far
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str, progress: FetchProgress<'_>) -> Result<Bytes, FetchError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let data = {
            let files = match self.files.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            files.get(url).cloned()
        };
        let data = data.ok_or_else(|| FetchError::NotFound(url.to_string()))?;
        progress(data.len() as u64, Some(data.len() as u64));
        Ok(data)
    }
}

/// Join a base URL and a relative path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://host/org/model/resolve/main/", "/ndarray-cache.json"),
            "https://host/org/model/resolve/main/ndarray-cache.json"
        );
        assert_eq!(join_url("https://host/m", "params_shard_0.bin"), "https://host/m/params_shard_0.bin");
    }

    #[test]
    fn test_initial_capacity_is_capped() {
        assert_eq!(initial_capacity(None), 0);
        assert_eq!(initial_capacity(Some(1024)), 1024);
        assert_eq!(initial_capacity(Some(u64::MAX)), MAX_PREALLOC as usize);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("mem://a", Bytes::from_static(b"hello"));

        let data = fetcher.fetch("mem://a", &|_, _| {}).await.unwrap();
        assert_eq!(&data[..], b"hello");

        let err = fetcher.fetch("mem://missing", &|_, _| {}).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
        assert_eq!(fetcher.transfers(), 2);
    }
}
