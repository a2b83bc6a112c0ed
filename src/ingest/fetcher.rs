// src/ingest/fetcher.rs
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use std::time::{Duration, Instant};

use super::{ensure_metrics_described, RawPayload};
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::sources::Source;

/// Retrieves the raw feed body of one source.
///
/// Implementations never panic or leak transport errors: every outcome is a
/// `RawPayload` or a typed `FetchError`.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<RawPayload, FetchError>;
    fn name(&self) -> &'static str;
}

/// reqwest-backed fetcher with per-request timeout and bounded retries.
pub struct HttpFetcher {
    http: reqwest::Client,
    policy: RetryPolicy,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.timeout().min(Duration::from_secs(5)))
            .timeout(cfg.timeout())
            .build()?;
        Ok(Self {
            http,
            policy: cfg.retry_policy(),
            max_body_bytes: cfg.max_body_bytes,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn attempt(&self, url: &str) -> Result<RawPayload, FetchError> {
        let resp = self
            .http
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5",
            )
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::bad_status(status.as_u16()));
        }
        if resp
            .content_length()
            .is_some_and(|n| n as usize > self.max_body_bytes)
        {
            return Err(FetchError::parse("feed too large"));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = resp.bytes().await.map_err(map_transport_error)?;
        if bytes.len() > self.max_body_bytes {
            return Err(FetchError::parse("feed too large"));
        }
        Ok(RawPayload {
            body: String::from_utf8_lossy(&bytes).into_owned(),
            status: status.as_u16(),
            content_type,
            fetched_at: Utc::now(),
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::timeout(e.to_string())
    } else if e.is_decode() || e.is_body() {
        FetchError::parse(e.to_string())
    } else {
        FetchError::unreachable(e.to_string())
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source: &Source) -> Result<RawPayload, FetchError> {
        ensure_metrics_described();
        let attempts = self.policy.attempts();
        let t0 = Instant::now();
        let mut attempt = 1;
        loop {
            counter!("ingest_fetch_attempts_total").increment(1);
            match self.attempt(&source.feed_url).await {
                Ok(payload) => {
                    histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                    return Ok(payload);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(
                        target: "ingest",
                        source = %source.id,
                        attempt,
                        kind = %e.kind,
                        backoff_ms = delay.as_millis() as u64,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    counter!("ingest_fetch_errors_total").increment(1);
                    tracing::warn!(
                        target: "ingest",
                        source = %source.id,
                        attempt,
                        kind = %e.kind,
                        error = %e.message,
                        "fetch failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
