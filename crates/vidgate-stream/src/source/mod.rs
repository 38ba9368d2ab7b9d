//! Blob source abstraction and its backends.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::StreamError;

/// Size and content type of a stored object, as reported by the backend.
#[derive(Debug, Clone)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_type: Option<String>,
}

/// A remote object store addressed by key.
///
/// Implementations are shared read-only across concurrent requests behind an
/// `Arc`; the streaming path never mutates them. Each `read_range` call is one
/// network round trip and must be idempotent, so any retry policy an
/// implementation carries is safe per chunk.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StreamError>;

    async fn metadata(&self, key: &str) -> Result<BlobMetadata, StreamError>;

    /// Reads the inclusive byte range `[start, end]` of the object.
    async fn read_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, StreamError>;
}

/// Write-side operations layered on top of [`BlobSource`]. The streaming core
/// never calls these; the gateway's upload and delete flows do.
#[async_trait]
pub trait BlobStore: BlobSource {
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<(), StreamError>;

    async fn delete(&self, key: &str) -> Result<(), StreamError>;
}
