// src/ingest/fetcher.rs
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use rand::Rng;
use serde_json::{json, Value};

use crate::ingest::limiter::RunContext;
use crate::ingest::types::{FetchOutcome, SourceDescriptor, SourceKind};

/// Longest slice of an error body that makes it into the logs.
const ERROR_BODY_LOG_LIMIT: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response body is not JSON: {0}")]
    Decode(reqwest::Error),
}

/// Anything that can turn a source into a [`FetchOutcome`].
///
/// Implementations never fail: every error ends up as an absent payload.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, ctx: &RunContext, source: Arc<SourceDescriptor>) -> FetchOutcome;
}

/// Exponential backoff with full jitter: attempt `n` sleeps a uniform draw from
/// `[0, min(base * 2^(n-1), max)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Upper bound of the delay that follows failed attempt `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let cap_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=cap_ms))
    }
}

/// REST (GET) and GraphQL (POST) fetcher over a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: Backoff,
}

impl HttpFetcher {
    pub fn new(backoff: Backoff) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tabular-ingest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self::with_client(client, backoff))
    }

    pub fn with_client(client: reqwest::Client, backoff: Backoff) -> Self {
        Self { client, backoff }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    async fn attempt(&self, source: &SourceDescriptor) -> Result<Value, FetchError> {
        let mut req = match source.kind {
            SourceKind::Rest => self.client.get(&source.url).query(&source.params),
            SourceKind::GraphQl => self
                .client
                .post(&source.url)
                .json(&json!({ "query": source.query.as_deref().unwrap_or_default() })),
        };
        for (k, v) in &source.headers {
            req = req.header(k, v);
        }

        let resp = req.timeout(source.timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_LOG_LIMIT),
            });
        }
        resp.json::<Value>().await.map_err(FetchError::Decode)
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, ctx: &RunContext, source: Arc<SourceDescriptor>) -> FetchOutcome {
        let t0 = Instant::now();
        let label = source.label.clone();
        let max_attempts = source.retry_attempts.max(1);
        tracing::info!(source = %label, url = %source.url, kind = %source.kind, "fetching");

        let mut attempts = 0u32;
        let outcome = loop {
            if attempts >= max_attempts {
                tracing::error!(source = %label, attempts, "fetch failed, retries exhausted");
                break FetchOutcome::absent(source.clone(), attempts);
            }

            // Slot is held only for the request itself, not for the backoff sleep.
            let permit = match ctx.limiter.acquire(&ctx.cancel).await {
                Ok(p) => p,
                Err(_) => {
                    tracing::warn!(source = %label, attempts, "fetch cancelled");
                    break FetchOutcome::absent(source.clone(), attempts);
                }
            };
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                r = self.attempt(&source) => Some(r),
            };
            drop(permit);

            match result {
                None => {
                    tracing::warn!(source = %label, attempts, "fetch cancelled");
                    break FetchOutcome::absent(source.clone(), attempts);
                }
                Some(Ok(payload)) => {
                    counter!("api_fetch_total", "api" => label.clone(), "status" => "success")
                        .increment(1);
                    tracing::info!(
                        source = %label,
                        attempts,
                        elapsed_ms = t0.elapsed().as_millis() as u64,
                        "fetched"
                    );
                    break FetchOutcome::fetched(source.clone(), payload, attempts);
                }
                Some(Err(e)) => {
                    counter!("api_fetch_total", "api" => label.clone(), "status" => "error")
                        .increment(1);
                    tracing::warn!(source = %label, attempt = attempts, error = %e, "fetch attempt failed");
                }
            }

            if attempts < max_attempts {
                let delay = self.backoff.delay(attempts);
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        tracing::warn!(source = %label, attempts, "fetch cancelled during backoff");
                        break FetchOutcome::absent(source.clone(), attempts);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        };

        histogram!("api_fetch_duration_seconds", "api" => label).record(t0.elapsed().as_secs_f64());
        outcome
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}
