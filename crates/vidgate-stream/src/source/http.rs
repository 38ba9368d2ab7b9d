//! HTTP blob source speaking byte-range reads against a remote object store.
//!
//! Works with any store that fronts objects over HTTP with `Range` support
//! (GCS/S3 gateways, nginx, a CDN). Metadata comes from a HEAD request; each
//! chunk is one bounded GET.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::warn;

use super::{BlobMetadata, BlobSource, BlobStore};
use crate::StreamError;

/// Configuration for the HTTP blob source.
#[derive(Debug, Clone)]
pub struct HttpBlobConfig {
    /// Per-request timeout in seconds (default: 30).
    pub timeout_secs: u64,
    /// Retry attempts for transient network failures (default: 3). Each chunk
    /// read is a pure range read, so retries are idempotent.
    pub max_retries: u32,
    /// Optional bearer token sent with every request.
    pub bearer_token: Option<String>,
}

impl Default for HttpBlobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            bearer_token: None,
        }
    }
}

/// Blob source backed by a remote HTTP object store.
pub struct HttpBlobSource {
    base_url: String,
    client: Client,
    config: HttpBlobConfig,
}

impl HttpBlobSource {
    pub fn new(base_url: impl Into<String>, config: HttpBlobConfig) -> Result<Self, StreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| StreamError::Backend(err.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            config,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn head(&self, key: &str) -> Result<reqwest::Response, StreamError> {
        let request = self.apply_auth(self.client.head(self.url_for(key)));
        request
            .send()
            .await
            .map_err(|err| StreamError::Backend(err.to_string()))
    }

    async fn read_once(&self, key: &str, start: u64, end: u64) -> Result<Bytes, StreamError> {
        let request = self
            .apply_auth(self.client.get(self.url_for(key)))
            .header(RANGE, format!("bytes={start}-{end}"));

        let response = request.send().await.map_err(|err| StreamError::BackendRead {
            key: key.to_string(),
            offset: start,
            reason: err.to_string(),
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StreamError::NotFound(key.to_string()));
        }
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            return Err(StreamError::BackendRead {
                key: key.to_string(),
                offset: start,
                reason: format!("unexpected status {status}"),
            });
        }

        response.bytes().await.map_err(|err| StreamError::BackendRead {
            key: key.to_string(),
            offset: start,
            reason: err.to_string(),
        })
    }

    fn is_transient(err: &StreamError) -> bool {
        matches!(err, StreamError::BackendRead { reason, .. }
            if reason.contains("timed out") || reason.contains("connect"))
    }
}

#[async_trait]
impl BlobSource for HttpBlobSource {
    async fn exists(&self, key: &str) -> Result<bool, StreamError> {
        let response = self.head(key).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(StreamError::Backend(format!(
                "existence check for '{key}' returned {status}"
            )));
        }
        Ok(true)
    }

    async fn metadata(&self, key: &str) -> Result<BlobMetadata, StreamError> {
        let response = self.head(key).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StreamError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(StreamError::Backend(format!(
                "metadata lookup for '{key}' returned {status}"
            )));
        }

        if let Some(accept_ranges) = response.headers().get(ACCEPT_RANGES) {
            if accept_ranges.to_str().map_or(false, |v| v == "none") {
                return Err(StreamError::RangeNotSupported);
            }
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                StreamError::Backend(format!("missing Content-Length for '{key}'"))
            })?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(BlobMetadata { size, content_type })
    }

    async fn read_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, StreamError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay_ms = 100u64 * (1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            match self.read_once(key, start, end).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if Self::is_transient(&err) && attempt < self.config.max_retries => {
                    warn!(key, offset = start, attempt, error = %err, "transient blob read failure, retrying");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| StreamError::BackendRead {
            key: key.to_string(),
            offset: start,
            reason: "retries exhausted".to_string(),
        }))
    }
}

#[async_trait]
impl BlobStore for HttpBlobSource {
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<(), StreamError> {
        let mut request = self.apply_auth(self.client.put(self.url_for(key))).body(body);
        if let Some(ct) = content_type {
            request = request.header(CONTENT_TYPE, ct);
        }

        let response = request
            .send()
            .await
            .map_err(|err| StreamError::Backend(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::Backend(format!(
                "upload of '{key}' returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StreamError> {
        let response = self
            .apply_auth(self.client.delete(self.url_for(key)))
            .send()
            .await
            .map_err(|err| StreamError::Backend(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StreamError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(StreamError::Backend(format!(
                "delete of '{key}' returned {status}"
            )));
        }
        Ok(())
    }
}
