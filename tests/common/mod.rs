// tests/common/mod.rs
//
// Shared fixtures for pipeline-level tests: a scripted fetcher, a flaky
// classifier, a store that is always down and helpers to build feeds.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use newsdesk::classify::{
    Category, Classification, ClassificationInput, Classifier, DynClassifier, Industry, Sentiment,
    StaticClassifier,
};
use newsdesk::config::{PipelineConfig, SourceSeed};
use newsdesk::error::{ClassificationError, FetchError, StoreError};
use newsdesk::ingest::{FeedFetcher, RawPayload};
use newsdesk::sources::{Source, SourceRegistry};
use newsdesk::stats::StatsAggregator;
use newsdesk::store::{
    ArticleCounts, ArticlePage, ArticleQuery, ArticleStore, ArticleUpdate, CanonicalArticle,
    InsertOutcome, MemoryStore,
};
use newsdesk::Orchestrator;

pub fn seed(name: &str) -> SourceSeed {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "rssFeed": format!("https://{}.example.com/rss", name.to_lowercase()),
        "credibility": 7,
        "automotiveFocus": 5,
    }))
    .expect("seed json")
}

/// Minimal RSS 2.0 document; items are `(title, link, description)`.
pub fn rss(items: &[(&str, &str, &str)]) -> String {
    let mut s = String::from("<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>t</title>");
    for (title, link, desc) in items {
        s.push_str(&format!(
            "<item><title>{title}</title><link>{link}</link>\
             <pubDate>Tue, 10 Jun 2025 14:30:00 +0000</pubDate>\
             <description>{desc}</description></item>"
        ));
    }
    s.push_str("</channel></rss>");
    s
}

#[derive(Clone)]
pub struct Reply {
    pub body: Result<String, FetchError>,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            body: Ok(body.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn err(e: FetchError) -> Self {
        Self {
            body: Err(e),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(body: impl Into<String>, delay: Duration) -> Self {
        Self {
            body: Ok(body.into()),
            delay,
        }
    }
}

/// Answers from a per-source script. Unknown sources are unreachable.
#[derive(Default)]
pub struct FixtureFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: AtomicUsize,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, source_id: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(source_id.to_string(), reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedFetcher for FixtureFetcher {
    async fn fetch(&self, source: &Source) -> Result<RawPayload, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().get(&source.id).cloned();
        let Some(reply) = reply else {
            return Err(FetchError::unreachable("no fixture"));
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.body.map(RawPayload::new)
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

pub fn fixed(confidence: f64) -> Classification {
    Classification {
        industry: Industry::Automotive,
        category: Category::Launch,
        sentiment: Sentiment::Positive,
        importance: 3,
        confidence,
        tags: vec!["fixture".to_string()],
    }
}

pub fn static_classifier(confidence: f64) -> DynClassifier {
    Arc::new(StaticClassifier {
        fixed: fixed(confidence),
    })
}

/// Hangs for `hang` on the first `failures` calls, then answers.
pub struct FlakyClassifier {
    pub failures: usize,
    pub hang: Duration,
    pub calls: AtomicUsize,
}

impl FlakyClassifier {
    pub fn new(failures: usize, hang: Duration) -> Self {
        Self {
            failures,
            hang,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Classifier for FlakyClassifier {
    async fn classify(
        &self,
        _input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            tokio::time::sleep(self.hang).await;
        }
        Ok(fixed(0.8))
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Fails the first `failures` calls outright, then waits `delay` and answers.
pub struct FailingThenSlowClassifier {
    pub failures: usize,
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
}

impl FailingThenSlowClassifier {
    pub fn new(failures: usize, delay: Duration) -> Self {
        Self {
            failures,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Classifier for FailingThenSlowClassifier {
    async fn classify(
        &self,
        _input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ClassificationError::ServiceUnavailable("warming up".into()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(fixed(0.8))
    }

    fn name(&self) -> &'static str {
        "failing-then-slow"
    }
}

/// Always fails, for the classification-failure paths.
pub struct BrokenClassifier;

#[async_trait]
impl Classifier for BrokenClassifier {
    async fn classify(
        &self,
        _input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        Err(ClassificationError::ServiceUnavailable("down".into()))
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

/// Every operation reports the backing store as unavailable.
pub struct DownStore;

fn down<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable("connection refused".into()))
}

#[async_trait]
impl ArticleStore for DownStore {
    async fn insert_if_absent(&self, _a: CanonicalArticle) -> Result<InsertOutcome, StoreError> {
        down()
    }
    async fn get(&self, _id: Uuid) -> Result<Option<CanonicalArticle>, StoreError> {
        down()
    }
    async fn find_by_link(&self, _l: &str) -> Result<Option<CanonicalArticle>, StoreError> {
        down()
    }
    async fn recent_from_source(
        &self,
        _s: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalArticle>, StoreError> {
        down()
    }
    async fn apply(&self, _id: Uuid, _u: ArticleUpdate) -> Result<CanonicalArticle, StoreError> {
        down()
    }
    async fn list(&self, _q: &ArticleQuery) -> Result<ArticlePage, StoreError> {
        down()
    }
    async fn reclassify_candidates(
        &self,
        _limit: usize,
        _max_attempts: u32,
    ) -> Result<Vec<CanonicalArticle>, StoreError> {
        down()
    }
    async fn counts(&self) -> Result<ArticleCounts, StoreError> {
        down()
    }
    async fn flush(&self) -> Result<(), StoreError> {
        down()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub fetcher: Arc<FixtureFetcher>,
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<dyn ArticleStore>,
}

pub fn harness_with(
    cfg: PipelineConfig,
    names: &[&str],
    classifier: DynClassifier,
    store: Arc<dyn ArticleStore>,
) -> Harness {
    let seeds: Vec<SourceSeed> = names.iter().map(|n| seed(n)).collect();
    let registry = Arc::new(SourceRegistry::from_seeds(&seeds, cfg.health.clone()));
    let fetcher = Arc::new(FixtureFetcher::new());
    let stats = Arc::new(StatsAggregator::new(cfg.health.clone()));
    let orchestrator = Orchestrator::new(
        cfg,
        registry.clone(),
        fetcher.clone(),
        classifier,
        store.clone(),
        stats,
    );
    Harness {
        orchestrator,
        fetcher,
        registry,
        store,
    }
}

pub fn harness(names: &[&str]) -> Harness {
    harness_with(
        PipelineConfig::default(),
        names,
        static_classifier(0.75),
        Arc::new(MemoryStore::new()),
    )
}

pub async fn all_articles(store: &dyn ArticleStore) -> Vec<CanonicalArticle> {
    let mut out = Vec::new();
    for state in newsdesk::store::ProcessingState::ALL {
        let q = ArticleQuery {
            limit: ArticleQuery::MAX_LIMIT,
            state: Some(state),
            ..ArticleQuery::default()
        };
        out.extend(store.list(&q).await.expect("list").items);
    }
    out
}
