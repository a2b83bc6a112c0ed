// src/classify/retrying.rs
use async_trait::async_trait;
use metrics::{counter, histogram};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{ensure_metrics_described, Classification, ClassificationInput, Classifier};
use crate::error::ClassificationError;
use crate::retry::RetryPolicy;

/// Bounds every call by `timeout` and retries failures with backoff, so a
/// classifier can never block a pipeline indefinitely.
pub struct RetryingClassifier<C> {
    inner: C,
    timeout: Duration,
    policy: RetryPolicy,
}

impl<C: Classifier> RetryingClassifier<C> {
    pub fn new(inner: C, timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            inner,
            timeout,
            policy,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: Classifier> Classifier for RetryingClassifier<C> {
    async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        ensure_metrics_described();
        let attempts = self.policy.attempts();
        let mut attempt = 1;
        loop {
            counter!("classify_attempts_total", "backend" => self.inner.name()).increment(1);
            let t0 = Instant::now();
            let result = match tokio::time::timeout(self.timeout, self.inner.classify(input)).await
            {
                Ok(r) => r,
                Err(_) => Err(ClassificationError::Timeout),
            };
            match result {
                Ok(c) => {
                    histogram!("classify_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                    return Ok(c);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(
                        target: "classify",
                        backend = self.inner.name(),
                        attempt,
                        kind = e.kind(),
                        backoff_ms = delay.as_millis() as u64,
                        "classification failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    counter!("classify_failures_total", "kind" => e.kind()).increment(1);
                    tracing::warn!(
                        target: "classify",
                        backend = self.inner.name(),
                        attempt,
                        error = %e,
                        "classification failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Remembers results by input hash so a non-deterministic backend answers
/// identical input identically. Failures are not cached.
pub struct CachingClassifier<C> {
    inner: C,
    cache: Mutex<HashMap<String, Classification>>,
    max_entries: usize,
}

impl<C: Classifier> CachingClassifier<C> {
    pub fn new(inner: C) -> Self {
        Self::with_capacity(inner, 10_000)
    }

    pub fn with_capacity(inner: C, max_entries: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("classifier cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cache_key(input: &ClassificationInput) -> String {
    let mut h = Sha256::new();
    for part in [&input.title, &input.summary, &input.source_name] {
        h.update(part.as_bytes());
        h.update([0u8]);
    }
    h.update(input.source_credibility.to_le_bytes());
    h.update(input.source_focus.to_le_bytes());
    for t in &input.raw_tags {
        h.update(t.as_bytes());
        h.update([0u8]);
    }
    h.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl<C: Classifier> Classifier for CachingClassifier<C> {
    async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        let key = cache_key(input);
        let cached = {
            let cache = self.cache.lock().expect("classifier cache poisoned");
            cache.get(&key).cloned()
        };
        if let Some(hit) = cached {
            counter!("classify_cache_hits_total").increment(1);
            return Ok(hit);
        }

        let fresh = self.inner.classify(input).await?;
        let mut cache = self.cache.lock().expect("classifier cache poisoned");
        if cache.len() >= self.max_entries {
            cache.clear();
        }
        Ok(cache.entry(key).or_insert(fresh).clone())
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
