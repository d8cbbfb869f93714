//! Raw document bytes behind a narrow key/value interface.
//!
//! The pipeline never writes through this interface. Files uploaded by the
//! host application are addressed by key; web pages by URL.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RagError, RagResult};

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Fetch the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> RagResult<Vec<u8>>;

    async fn exists(&self, key: &str) -> RagResult<bool>;

    /// Open the object under `key` for incremental reads.
    ///
    /// The default buffers the whole object through `get`; providers that
    /// can stream should override it.
    async fn open(&self, key: &str) -> RagResult<ObjectReader> {
        let bytes = self.get(key).await?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Blocking reader over one stored object.
pub type ObjectReader = Box<dyn Read + Send>;

fn unavailable(key: &str, reason: impl ToString) -> RagError {
    RagError::SourceUnavailable {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Files under a root directory; keys are relative paths.
#[derive(Debug, Clone)]
pub struct FsStorageProvider {
    root: PathBuf,
}

impl FsStorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key, refusing absolute paths and `..` components.
    fn resolve(&self, key: &str) -> RagResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || key.is_empty() {
            return Err(unavailable(key, "key must be a relative path inside the root"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageProvider for FsStorageProvider {
    async fn get(&self, key: &str) -> RagResult<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| unavailable(key, e))
    }

    async fn exists(&self, key: &str) -> RagResult<bool> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| unavailable(key, e))
    }

    async fn open(&self, key: &str) -> RagResult<ObjectReader> {
        let path = self.resolve(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| unavailable(key, e))?;
        Ok(Box::new(file.into_std().await))
    }
}

/// In-process provider, handy for hosts that already hold the bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageProvider {
    objects: Arc<DashMap<String, Arc<[u8]>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.insert(key.into(), Arc::from(bytes.into()));
    }

    pub fn remove(&self, key: &str) {
        self.objects.remove(key);
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn get(&self, key: &str) -> RagResult<Vec<u8>> {
        self.objects
            .get(key)
            .map(|entry| entry.value().to_vec())
            .ok_or_else(|| unavailable(key, "no such key"))
    }

    async fn exists(&self, key: &str) -> RagResult<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn open(&self, key: &str) -> RagResult<ObjectReader> {
        let bytes = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| unavailable(key, "no such key"))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Fetches web pages for `SourceRef::Url` documents.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    client: reqwest::Client,
}

impl UrlFetcher {
    pub fn new(timeout: Duration) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Download `url`, aborting as soon as the body crosses `max_bytes`.
    ///
    /// Returns the body and the response content type when the server sent one.
    pub async fn fetch(&self, url: &str, max_bytes: u64) -> RagResult<(Vec<u8>, Option<String>)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable(url, e))?;

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(RagError::TooLarge { limit: max_bytes });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| unavailable(url, e))?;
            if (body.len() + piece.len()) as u64 > max_bytes {
                return Err(RagError::TooLarge { limit: max_bytes });
            }
            body.extend_from_slice(&piece);
        }

        Ok((body, content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_provider_reads_relative_keys() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("docs")).unwrap();
        std::fs::write(temp_dir.path().join("docs/a.txt"), b"hello").unwrap();

        let provider = FsStorageProvider::new(temp_dir.path());
        assert!(provider.exists("docs/a.txt").await.unwrap());
        assert!(!provider.exists("docs/missing.txt").await.unwrap());
        assert_eq!(provider.get("docs/a.txt").await.unwrap(), b"hello");

        let mut opened = String::new();
        provider
            .open("docs/a.txt")
            .await
            .unwrap()
            .read_to_string(&mut opened)
            .unwrap();
        assert_eq!(opened, "hello");
        assert!(provider.open("docs/missing.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_provider_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FsStorageProvider::new(temp_dir.path());

        for key in ["../etc/passwd", "/etc/passwd", ""] {
            assert!(matches!(
                provider.get(key).await,
                Err(RagError::SourceUnavailable { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_source_unavailable() {
        let provider = MemoryStorageProvider::new();
        provider.put("present", b"x".to_vec());

        assert!(provider.exists("present").await.unwrap());
        let err = provider.get("absent").await.unwrap_err();
        assert!(matches!(err, RagError::SourceUnavailable { key, .. } if key == "absent"));
        assert!(matches!(
            provider.open("absent").await,
            Err(RagError::SourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_provider_open_reads_in_pieces() {
        let provider = MemoryStorageProvider::new();
        provider.put("big", vec![7u8; 10_000]);

        let mut reader = provider.open("big").await.unwrap();
        let mut piece = [0u8; 64];
        assert_eq!(reader.read(&mut piece).unwrap(), 64);
        assert!(piece.iter().all(|b| *b == 7));
    }
}
