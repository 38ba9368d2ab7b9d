//! Usage metering: bandwidth checks and upload/deletion accounting.
//!
//! Metering is an optional collaborator. When the service is configured, the
//! upload flow asks it whether the user still has bandwidth and records every
//! upload and deletion; when it is absent (or down for reads that tolerate
//! it), the gateway degrades gracefully rather than refusing traffic.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::warn;

const METERING_TIMEOUT_SECS: u64 = 10;

/// Thin HTTP client for the metering service.
#[derive(Debug, Clone)]
pub struct MeteringClient {
    base_url: String,
    client: Client,
}

impl MeteringClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(METERING_TIMEOUT_SECS))
            .build()
            .context("building metering HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Asks whether the user has enough bandwidth left for an upload of
    /// `file_size` bytes. `None` means the check failed or was denied.
    pub async fn check_upload_bandwidth(&self, token: &str, file_size: u64) -> Option<Value> {
        let request = self
            .authorized(self.client.post(self.url("/api/usage/check-upload-bandwidth")), token)
            .json(&json!({ "file_size": file_size }));
        self.execute(request, "bandwidth check").await
    }

    /// Records a completed upload. `None` means the record was not accepted.
    pub async fn log_upload(&self, token: &str, file_name: &str, file_size: u64) -> Option<Value> {
        let request = self
            .authorized(self.client.post(self.url("/api/usage/log-upload")), token)
            .json(&json!({ "file_name": file_name, "file_size": file_size }));
        self.execute(request, "upload record").await
    }

    /// Records a deletion so the user's usage history stays consistent.
    pub async fn log_deletion(
        &self,
        token: &str,
        file_name: &str,
        file_size: u64,
    ) -> Option<Value> {
        let request = self
            .authorized(self.client.post(self.url("/api/usage/log-deletion")), token)
            .json(&json!({ "file_name": file_name, "file_size": file_size }));
        self.execute(request, "deletion record").await
    }

    /// Fetches usage alert flags (storage and bandwidth thresholds). Failures
    /// here never block the request that asked.
    pub async fn check_for_alerts(&self, token: &str) -> Option<Value> {
        let request =
            self.authorized(self.client.get(self.url("/api/usage/check-usage-alerts")), token);
        self.execute(request, "usage alerts").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Bearer {token}"))
    }

    async fn execute(&self, request: RequestBuilder, what: &str) -> Option<Value> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, what, "metering service unreachable");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), what, "metering service rejected request");
            return None;
        }

        match response.json::<Value>().await {
            Ok(body) => Some(body),
            Err(error) => {
                warn!(%error, what, "metering service returned an unparseable body");
                None
            }
        }
    }
}
