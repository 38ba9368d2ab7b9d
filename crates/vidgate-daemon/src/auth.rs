//! Bearer-token validation against the external identity service.
//!
//! The gateway never mints or verifies tokens itself. Every authenticated
//! route forwards the presented token to the identity service and treats any
//! failure (network, non-200, malformed body) as an invalid credential.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::warn;

const VALIDATE_TIMEOUT_SECS: u64 = 10;

/// The identity the external service vouches for.
#[derive(Debug, Clone, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub email: String,
}

/// Thin HTTP client for the identity service.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    base_url: String,
    client: Client,
}

impl IdentityClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(VALIDATE_TIMEOUT_SECS))
            .build()
            .context("building identity HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Resolves a bearer token to a user, or `None` when the token is invalid,
    /// expired, or the identity service is unreachable. Callers map `None` to
    /// 401 without distinguishing the causes.
    pub async fn validate_token(&self, token: &str) -> Option<UserIdentity> {
        let url = format!("{}/api/auth/validate", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "identity service unreachable during token validation");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            return None;
        }

        match response.json::<UserIdentity>().await {
            Ok(user) => Some(user),
            Err(error) => {
                warn!(%error, "identity service returned an unparseable validation body");
                None
            }
        }
    }
}
