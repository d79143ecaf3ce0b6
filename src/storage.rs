//! Archive blob service port
//!
//! Archives above the literal size threshold live in the blob service and
//! are addressed by an opaque id. The stable URL form is what a fetcher
//! sidecar downloads from; integrity is checked against the SHA-256
//! checksum stored on the package.

use crate::error::{Error, Result};
use crate::types::Checksum;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Blob upload/download by opaque id
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob; returns its id
    async fn upload(&self, data: Bytes) -> Result<String>;

    async fn download(&self, id: &str) -> Result<Bytes>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Stable URL for fetcher sidecars
    fn url(&self, id: &str) -> String;
}

/// Download a blob and verify it against the expected checksum
pub async fn download_verified(
    store: &dyn BlobStore,
    id: &str,
    expected: &Checksum,
) -> Result<Bytes> {
    let data = store.download(id).await?;
    let actual = Checksum::sha256(&data);
    if actual.sum != expected.sum {
        return Err(Error::Invalid(format!(
            "checksum mismatch for blob '{}': expected {}, got {}",
            id, expected.sum, actual.sum
        )));
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory blob store (tests and single-node deployments)
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
    counter: AtomicU64,
    base_url: String,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_base_url("memory://storage")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
            base_url: base_url.into(),
        }
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().unwrap().is_empty()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, data: Bytes) -> Result<String> {
        let id = format!("blob-{:08x}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.blobs.write().unwrap().insert(id.clone(), data);
        Ok(id)
    }

    async fn download(&self, id: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob '{}'", id)))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.blobs.write().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("blob '{}'", id))),
        }
    }

    fn url(&self, id: &str) -> String {
        format!("{}/{}", self.base_url, id)
    }
}

// ---------------------------------------------------------------------------
// HttpBlobStore — remote archive storage service
// ---------------------------------------------------------------------------

/// Blob store backed by the archive storage service over HTTP
pub struct HttpBlobStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, data: Bytes) -> Result<String> {
        let url = format!("{}/v1/archive", self.base_url);
        let resp = self
            .client
            .post(&url)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("storage upload failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Transient(format!(
                "storage upload returned {}: {}",
                status, body
            )));
        }

        #[derive(serde::Deserialize)]
        struct UploadResponse {
            id: String,
        }
        let parsed: UploadResponse = resp.json().await.map_err(|e| {
            Error::Other(format!("failed to parse storage upload response: {}", e))
        })?;
        Ok(parsed.id)
    }

    async fn download(&self, id: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(self.url(id))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("storage download failed: {}", e)))?;

        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await.map_err(Error::Http)?),
            reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound(format!("blob '{}'", id))),
            s => Err(Error::Transient(format!(
                "storage download for '{}' returned {}",
                id, s
            ))),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(id))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("storage delete failed: {}", e)))?;

        if resp.status().is_success() {
            Ok(())
        } else if resp.status() == reqwest::StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!("blob '{}'", id)))
        } else {
            Err(Error::Transient(format!(
                "storage delete for '{}' returned {}",
                id,
                resp.status()
            )))
        }
    }

    fn url(&self, id: &str) -> String {
        format!("{}/v1/archive/{}", self.base_url, id)
    }
}
