// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod sources;
pub mod stats;
pub mod store;

use std::sync::Arc;

use anyhow::Context;

pub use crate::api::{create_router as router, AppState};
pub use crate::orchestrator::{CycleReport, Orchestrator};

use crate::classify::build_classifier;
use crate::config::{PipelineConfig, SourceSeed};
use crate::ingest::HttpFetcher;
use crate::sources::SourceRegistry;
use crate::stats::StatsAggregator;
use crate::store::{ArticleStore, MemoryStore};

/// Wire the production pipeline: HTTP fetcher, configured classifier and
/// the in-memory store (snapshot-backed when `store.snapshot_path` is set).
pub fn build_orchestrator(cfg: PipelineConfig, seeds: &[SourceSeed]) -> anyhow::Result<Orchestrator> {
    let registry = Arc::new(SourceRegistry::from_seeds(seeds, cfg.health.clone()));
    let fetcher = Arc::new(HttpFetcher::new(&cfg.fetch)?);
    let classifier = build_classifier(&cfg.classifier)?;
    let store: Arc<dyn ArticleStore> = match &cfg.store.snapshot_path {
        Some(path) => Arc::new(
            MemoryStore::with_snapshot(path)
                .with_context(|| format!("loading article snapshot {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let stats = Arc::new(StatsAggregator::new(cfg.health.clone()));

    tracing::info!(
        target: "pipeline",
        sources = seeds.len(),
        classifier = classifier.name(),
        "pipeline assembled"
    );
    Ok(Orchestrator::new(cfg, registry, fetcher, classifier, store, stats))
}
