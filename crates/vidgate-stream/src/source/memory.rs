//! In-memory blob source used by tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{BlobMetadata, BlobSource, BlobStore};
use crate::StreamError;

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Bytes,
    content_type: Option<String>,
}

/// Map-backed blob store with hooks for observing reads and injecting
/// mid-stream failures, so cancellation and abort behavior stay testable.
#[derive(Debug, Default)]
pub struct MemoryBlobSource {
    blobs: RwLock<HashMap<String, StoredBlob>>,
    reads: AtomicUsize,
    fail_at: Mutex<Option<u64>>,
}

impl MemoryBlobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, bytes: Bytes, content_type: Option<&str>) {
        self.blobs.write().expect("blob map poisoned").insert(
            key.to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
    }

    /// Number of `read_range` calls issued so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Makes the read that starts at `offset` fail with a backend error.
    pub fn fail_read_at(&self, offset: u64) {
        *self.fail_at.lock().expect("fail hook poisoned") = Some(offset);
    }

    fn lookup(&self, key: &str) -> Option<StoredBlob> {
        self.blobs
            .read()
            .expect("blob map poisoned")
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl BlobSource for MemoryBlobSource {
    async fn exists(&self, key: &str) -> Result<bool, StreamError> {
        Ok(self.lookup(key).is_some())
    }

    async fn metadata(&self, key: &str) -> Result<BlobMetadata, StreamError> {
        let blob = self
            .lookup(key)
            .ok_or_else(|| StreamError::NotFound(key.to_string()))?;
        Ok(BlobMetadata {
            size: blob.bytes.len() as u64,
            content_type: blob.content_type,
        })
    }

    async fn read_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, StreamError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if let Some(fail_offset) = *self.fail_at.lock().expect("fail hook poisoned") {
            if start == fail_offset {
                return Err(StreamError::BackendRead {
                    key: key.to_string(),
                    offset: start,
                    reason: "injected backend failure".to_string(),
                });
            }
        }

        let blob = self
            .lookup(key)
            .ok_or_else(|| StreamError::NotFound(key.to_string()))?;

        let len = blob.bytes.len() as u64;
        if start >= len || end >= len || start > end {
            return Err(StreamError::BackendRead {
                key: key.to_string(),
                offset: start,
                reason: format!("range {start}-{end} outside object of {len} bytes"),
            });
        }

        Ok(blob.bytes.slice(start as usize..=end as usize))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobSource {
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<(), StreamError> {
        self.insert(key, body, content_type);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StreamError> {
        self.blobs.write().expect("blob map poisoned").remove(key);
        Ok(())
    }
}
