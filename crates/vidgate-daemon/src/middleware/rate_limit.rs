use std::{
    collections::HashMap,
    convert::Infallible,
    hash::{Hash, Hasher},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub stream_per_minute: u64,
    pub mutation_per_minute: u64,
    pub status_per_minute: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            stream_per_minute: 120,
            mutation_per_minute: 60,
            status_per_minute: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();

        // Classify and fingerprint before the future so it never borrows the
        // request across an await.
        let class = classify(request.uri().path());
        let fingerprint = identity_fingerprint(&request);

        Box::pin(async move {
            let verdict = match class {
                Some(class) => state.check(class, fingerprint).await,
                None => Ok(()),
            };
            match verdict {
                Ok(()) => inner.call(request).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<HashMap<RateKey, Counter>>,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    async fn check(
        &self,
        class: RateClass,
        fingerprint: String,
    ) -> Result<(), RateLimitRejection> {
        let limit = self.config.limit_for(class);
        if limit == 0 {
            return Err(RateLimitRejection::new(
                class,
                0,
                self.config.window,
                self.config.window,
            ));
        }

        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        let window = self.config.window;
        let entry = counters
            .entry(RateKey {
                class,
                identity: fingerprint.clone(),
            })
            .or_insert_with(|| Counter {
                window_start: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after = window
                .checked_sub(elapsed)
                .unwrap_or_default()
                .max(Duration::from_secs(1));
            warn!(
                category = class.as_str(),
                identity_fingerprint = %fingerprint,
                limit,
                "rate limit exceeded"
            );
            return Err(RateLimitRejection::new(class, limit, window, retry_after));
        }

        entry.count += 1;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq)]
struct RateKey {
    class: RateClass,
    identity: String,
}

impl PartialEq for RateKey {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.identity == other.identity
    }
}

impl Hash for RateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.identity.hash(state);
    }
}

#[derive(Clone, Debug)]
struct Counter {
    window_start: Instant,
    count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum RateClass {
    Stream,
    Mutation,
    Status,
}

impl RateClass {
    fn as_str(self) -> &'static str {
        match self {
            RateClass::Stream => "stream",
            RateClass::Mutation => "mutation",
            RateClass::Status => "status",
        }
    }
}

impl RateLimitConfig {
    fn limit_for(&self, class: RateClass) -> u64 {
        match class {
            RateClass::Stream => self.stream_per_minute,
            RateClass::Mutation => self.mutation_per_minute,
            RateClass::Status => self.status_per_minute,
        }
    }
}

#[derive(Debug)]
struct RateLimitRejection {
    class: RateClass,
    limit: u64,
    window: Duration,
    retry_after: Duration,
}

impl RateLimitRejection {
    fn new(class: RateClass, limit: u64, window: Duration, retry_after: Duration) -> Self {
        Self {
            class,
            limit,
            window,
            retry_after,
        }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after.as_secs().max(1);
        let body = RateLimitBody {
            error: "rate_limit_exceeded",
            category: self.class.as_str(),
            limit: self.limit,
            window_seconds: self.window.as_secs(),
            retry_after_seconds: retry_after_secs,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&retry_after_secs.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        response
    }
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    category: &'static str,
    limit: u64,
    window_seconds: u64,
    retry_after_seconds: u64,
}

fn classify(path: &str) -> Option<RateClass> {
    if path.starts_with("/stream/") || path.starts_with("/download/") {
        Some(RateClass::Stream)
    } else if path.starts_with("/upload") || path.starts_with("/delete-file") {
        Some(RateClass::Mutation)
    } else if path.starts_with("/storage-status") {
        Some(RateClass::Status)
    } else {
        None
    }
}

fn identity_fingerprint<B>(request: &Request<B>) -> String {
    let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return "anonymous".to_string();
    };

    let digest = Sha256::digest(value.as_bytes());
    STANDARD_NO_PAD.encode(digest)
}
