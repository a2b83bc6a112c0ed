//! # Orchestrator
//! Runs fetch cycles: fans out one pipeline per dispatchable source
//! (fetch → normalize → dedup → classify → store), bounded by semaphores,
//! and folds exactly one outcome per dispatched source back into the
//! registry, even when the cycle deadline or a shutdown cuts it short.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::classify::{ClassificationInput, DynClassifier};
use crate::config::PipelineConfig;
use crate::dedup::{Decision, Deduplicator};
use crate::error::{FetchError, StoreError};
use crate::ingest::{normalize, ArticleDraft, FeedFetcher};
use crate::sources::{Source, SourceOutcome, SourceRegistry};
use crate::stats::StatsAggregator;
use crate::store::{ArticleStore, ArticleUpdate, CanonicalArticle, InsertOutcome, ProcessingState};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_cycles_total", "Completed orchestrator cycles.");
        describe_counter!("pipeline_items_fetched_total", "Feed entries seen by cycles.");
        describe_counter!("pipeline_items_stored_total", "New articles stored and classified.");
        describe_counter!("pipeline_items_updated_total", "Stored articles refreshed by an update.");
        describe_counter!("pipeline_items_duplicate_total", "Drafts discarded as duplicates.");
        describe_counter!("pipeline_items_failed_total", "Drafts stored as failed or not stored.");
        describe_counter!("pipeline_source_failures_total", "Source pipelines that ended in a failure.");
        describe_histogram!("pipeline_cycle_ms", "Cycle wall time in milliseconds.");
        describe_gauge!("pipeline_last_cycle_ts", "Unix ts when the last cycle finished.");
    });
}

/// Where one draft ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DraftOutcome {
    Stored,
    Updated,
    Duplicate,
    Failed,
}

/// Per-source processing batch counters. Written by the source pipeline,
/// read by the collector, also after the pipeline was aborted.
#[derive(Debug, Default)]
struct BatchTally {
    fetched: AtomicUsize,
    skipped: AtomicUsize,
    stored: AtomicUsize,
    updated: AtomicUsize,
    duplicate: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchTally {
    fn record(&self, outcome: DraftOutcome) {
        let bucket = match outcome {
            DraftOutcome::Stored => &self.stored,
            DraftOutcome::Updated => &self.updated,
            DraftOutcome::Duplicate => &self.duplicate,
            DraftOutcome::Failed => &self.failed,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    fn skip(&self, n: usize) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
        self.fetched.fetch_add(n, Ordering::Relaxed);
    }

    fn fold_into(&self, report: &mut CycleReport) {
        report.items_fetched += self.fetched.load(Ordering::Relaxed);
        report.items_skipped += self.skipped.load(Ordering::Relaxed);
        report.items_stored += self.stored.load(Ordering::Relaxed);
        report.items_updated += self.updated.load(Ordering::Relaxed);
        report.items_duplicate += self.duplicate.load(Ordering::Relaxed);
        report.items_failed += self.failed.load(Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceCycleSummary {
    pub source_id: String,
    pub ok: bool,
    pub items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one cycle.
///
/// `items_fetched = items_skipped + items_stored + items_updated +
/// items_duplicate + items_failed`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources_attempted: usize,
    pub sources_failed: usize,
    pub items_fetched: usize,
    pub items_skipped: usize,
    pub items_stored: usize,
    pub items_updated: usize,
    pub items_duplicate: usize,
    pub items_failed: usize,
    /// Backlog articles from earlier cycles that this cycle classified.
    /// Drafts of this cycle are never among them.
    pub items_reclassified: usize,
    pub store_unavailable: bool,
    pub deadline_exceeded: bool,
    pub cancelled: bool,
    pub last_source: Option<String>,
    pub sources: Vec<SourceCycleSummary>,
}

impl CycleReport {
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            sources_attempted: 0,
            sources_failed: 0,
            items_fetched: 0,
            items_skipped: 0,
            items_stored: 0,
            items_updated: 0,
            items_duplicate: 0,
            items_failed: 0,
            items_reclassified: 0,
            store_unavailable: false,
            deadline_exceeded: false,
            cancelled: false,
            last_source: None,
            sources: Vec::new(),
        }
    }

    /// Share of attempted sources that failed; 0 when nothing was attempted.
    pub fn failure_rate(&self) -> f64 {
        if self.sources_attempted == 0 {
            0.0
        } else {
            self.sources_failed as f64 / self.sources_attempted as f64
        }
    }

    pub fn failed_entirely(&self) -> bool {
        self.sources_attempted > 0 && self.sources_failed == self.sources_attempted
    }

    /// Articles written by this cycle, new and refreshed.
    pub fn items_saved(&self) -> usize {
        self.items_stored + self.items_updated
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReclassifySummary {
    pub attempted: usize,
    pub processed: usize,
    pub failed: usize,
    pub store_unavailable: bool,
    pub deadline_exceeded: bool,
}

impl ReclassifySummary {
    fn tally(&mut self, joined: Result<Result<bool, StoreError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(true)) => self.processed += 1,
            Ok(Ok(false)) => self.failed += 1,
            Ok(Err(e)) => {
                tracing::error!(target: "pipeline", error = %e, "reclassification write failed");
                self.failed += 1;
                self.store_unavailable = true;
            }
            Err(je) => {
                tracing::error!(target: "pipeline", error = %je, "reclassification task failed");
                self.failed += 1;
            }
        }
    }
}

/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<SourceRegistry>,
    fetcher: Arc<dyn FeedFetcher>,
    classifier: DynClassifier,
    store: Arc<dyn ArticleStore>,
    stats: Arc<StatsAggregator>,
    dedup: Deduplicator,
    cfg: Arc<PipelineConfig>,
    fetch_slots: Arc<Semaphore>,
    classify_slots: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        cfg: PipelineConfig,
        registry: Arc<SourceRegistry>,
        fetcher: Arc<dyn FeedFetcher>,
        classifier: DynClassifier,
        store: Arc<dyn ArticleStore>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(cfg.dedup.clone()),
            fetch_slots: Arc::new(Semaphore::new(cfg.orchestrator.max_in_flight_sources)),
            classify_slots: Arc::new(Semaphore::new(
                cfg.orchestrator.max_in_flight_classifications,
            )),
            cfg: Arc::new(cfg),
            registry,
            fetcher,
            classifier,
            store,
            stats,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArticleStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    /// One full pass over all dispatchable sources.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_until(std::future::pending::<()>()).await
    }

    /// Like [`Orchestrator::run_cycle`], but stops early once `shutdown`
    /// resolves. Outstanding pipelines are aborted and recorded as failures.
    pub async fn run_cycle_until<F>(&self, shutdown: F) -> CycleReport
    where
        F: Future<Output = ()>,
    {
        ensure_metrics_described();
        let started_at = Utc::now();
        let t0 = Instant::now();
        let deadline = tokio::time::Instant::now() + self.cfg.orchestrator.cycle_deadline();
        let mut report = CycleReport::empty(started_at);

        let sources = self
            .registry
            .list_dispatchable(started_at, self.cfg.orchestrator.unhealthy_retry_after());
        report.sources_attempted = sources.len();
        tracing::info!(target: "pipeline", cycle = %report.id, sources = sources.len(), "cycle started");

        let store_down = Arc::new(AtomicBool::new(false));
        let mut set: JoinSet<(String, Result<Duration, FetchError>)> = JoinSet::new();
        let mut running: HashMap<String, (Source, Arc<BatchTally>)> = HashMap::new();
        for source in sources {
            let tally = Arc::new(BatchTally::default());
            let this = self.clone();
            let src = source.clone();
            let t = tally.clone();
            let down = store_down.clone();
            set.spawn(async move {
                let id = src.id.clone();
                (id, this.run_source(src, t, down).await)
            });
            running.insert(source.id.clone(), (source, tally));
        }

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    report.cancelled = true;
                    break;
                }
                _ = &mut sleep => {
                    report.deadline_exceeded = true;
                    break;
                }
                next = set.join_next() => match next {
                    None => break,
                    Some(Ok((id, result))) => self.settle(&id, result, &mut running, &mut report),
                    Some(Err(je)) => {
                        tracing::error!(target: "pipeline", error = %je, "source pipeline panicked");
                    }
                },
            }
        }

        let cut_short = !set.is_empty();
        if cut_short {
            tracing::warn!(
                target: "pipeline",
                cycle = %report.id,
                outstanding = set.len(),
                cancelled = report.cancelled,
                "cycle cut short, aborting outstanding sources"
            );
            set.abort_all();
            while let Some(joined) = set.join_next().await {
                // Pipelines that finished before the abort landed still count.
                if let Ok((id, result)) = joined {
                    self.settle(&id, result, &mut running, &mut report);
                }
            }
        }

        // Whatever is left was aborted or panicked; each still gets one outcome.
        let reason = if report.cancelled {
            "cycle cancelled"
        } else if cut_short {
            "cycle deadline exceeded"
        } else {
            "source pipeline panicked"
        };
        let leftover: Vec<String> = running.keys().cloned().collect();
        for id in leftover {
            let err = if cut_short {
                FetchError::timeout(reason)
            } else {
                FetchError::unreachable(reason)
            };
            self.settle(&id, Err(err), &mut running, &mut report);
        }

        report.store_unavailable = store_down.load(Ordering::SeqCst);
        // An all-failed cycle leaves stored articles untouched.
        let run_backlog = !report.store_unavailable
            && !report.cancelled
            && !report.deadline_exceeded
            && !report.failed_entirely();
        if run_backlog {
            let backlog = self
                .reclassify(
                    self.cfg.orchestrator.reclassify_per_cycle,
                    Some(started_at),
                    Some(deadline),
                )
                .await;
            report.items_reclassified = backlog.processed;
            report.store_unavailable |= backlog.store_unavailable;
            report.deadline_exceeded |= backlog.deadline_exceeded;
        }
        if !report.store_unavailable {
            if let Err(e) = self.store.flush().await {
                tracing::error!(target: "pipeline", error = %e, "store flush failed");
                report.store_unavailable = true;
            }
        }

        report.finished_at = Utc::now();
        report.duration_ms = t0.elapsed().as_millis() as u64;
        self.publish(&report);
        report
    }

    /// Record the single outcome of one source pipeline.
    fn settle(
        &self,
        id: &str,
        result: Result<Duration, FetchError>,
        running: &mut HashMap<String, (Source, Arc<BatchTally>)>,
        report: &mut CycleReport,
    ) {
        let result = result.map(Some);
        let Some((source, tally)) = running.remove(id) else {
            return;
        };
        tally.fold_into(report);
        let items = tally.fetched.load(Ordering::Relaxed);

        let (outcome, elapsed) = match result {
            Ok(elapsed) => (SourceOutcome::Success(items), elapsed),
            Err(e) => {
                report.sources_failed += 1;
                counter!("pipeline_source_failures_total", "kind" => e.kind.to_string())
                    .increment(1);
                (SourceOutcome::Failure(e), None)
            }
        };
        report.sources.push(SourceCycleSummary {
            source_id: source.id.clone(),
            ok: outcome.is_success(),
            items,
            error: match &outcome {
                SourceOutcome::Failure(e) => Some(e.to_string()),
                SourceOutcome::Success(_) => None,
            },
        });
        report.last_source = Some(source.name.clone());
        if let Err(e) = self
            .registry
            .record_outcome_at(&source.id, outcome, elapsed, Utc::now())
        {
            tracing::warn!(target: "pipeline", error = %e, "outcome for unknown source");
        }
    }

    fn publish(&self, report: &CycleReport) {
        counter!("pipeline_cycles_total").increment(1);
        counter!("pipeline_items_fetched_total").increment(report.items_fetched as u64);
        counter!("pipeline_items_stored_total").increment(report.items_stored as u64);
        counter!("pipeline_items_updated_total").increment(report.items_updated as u64);
        counter!("pipeline_items_duplicate_total").increment(report.items_duplicate as u64);
        counter!("pipeline_items_failed_total").increment(report.items_failed as u64);
        histogram!("pipeline_cycle_ms").record(report.duration_ms as f64);
        gauge!("pipeline_last_cycle_ts").set(report.finished_at.timestamp() as f64);
        self.stats.record_cycle(report);

        tracing::info!(
            target: "pipeline",
            cycle = %report.id,
            attempted = report.sources_attempted,
            failed = report.sources_failed,
            fetched = report.items_fetched,
            stored = report.items_stored,
            updated = report.items_updated,
            duplicate = report.items_duplicate,
            items_failed = report.items_failed,
            duration_ms = report.duration_ms,
            store_unavailable = report.store_unavailable,
            "cycle finished"
        );
    }

    /// Fetch, normalize and process one source. Returns the fetch latency
    /// on success; the item counts go through `tally`.
    async fn run_source(
        self,
        source: Source,
        tally: Arc<BatchTally>,
        store_down: Arc<AtomicBool>,
    ) -> Result<Duration, FetchError> {
        let t0 = Instant::now();
        let payload = {
            let _permit = self
                .fetch_slots
                .acquire()
                .await
                .map_err(|_| FetchError::unreachable("fetch pool closed"))?;
            self.fetcher.fetch(&source).await?
        };
        let elapsed = t0.elapsed();

        let mut drafts = normalize(&source, &payload, self.cfg.fetch.max_items_per_source)?;
        for draft in drafts.by_ref() {
            if store_down.load(Ordering::SeqCst) {
                tally.record(DraftOutcome::Failed);
                continue;
            }
            match self.process_draft(&source, draft).await {
                Ok(outcome) => tally.record(outcome),
                Err(e) => {
                    tracing::error!(
                        target: "pipeline",
                        source = %source.id,
                        error = %e,
                        "store unavailable, abandoning cycle writes"
                    );
                    store_down.store(true, Ordering::SeqCst);
                    tally.record(DraftOutcome::Failed);
                }
            }
        }
        tally.skip(drafts.skipped());
        Ok(elapsed)
    }

    /// Dedup, store and classify one draft. Only `StoreError::Unavailable`
    /// escapes; a constraint violation means another writer got there first.
    async fn process_draft(
        &self,
        source: &Source,
        draft: ArticleDraft,
    ) -> Result<DraftOutcome, StoreError> {
        let store = self.store.as_ref();
        match self.dedup.classify(&draft, store).await? {
            Decision::Duplicate { .. } => Ok(DraftOutcome::Duplicate),
            Decision::UpdateOf { id, substantial } => {
                let refresh = ArticleUpdate::RefreshContent {
                    title: draft.title,
                    summary: draft.summary,
                    published_at: (!draft.published_fallback).then_some(draft.published_at),
                    raw_tags: draft.raw_tags,
                };
                let article = match store.apply(id, refresh).await {
                    Ok(a) => a,
                    Err(StoreError::ConstraintViolation(_)) => return Ok(DraftOutcome::Duplicate),
                    Err(e) => return Err(e),
                };
                tracing::debug!(target: "pipeline", article = %id, substantial, "article updated");
                if substantial || article.state != ProcessingState::Processed {
                    self.classify_article(&article, Some(source)).await?;
                }
                Ok(DraftOutcome::Updated)
            }
            Decision::New => {
                let article = CanonicalArticle::pending(&draft, &source.name, Utc::now());
                let id = match store.insert_if_absent(article.clone()).await {
                    Ok(InsertOutcome::Inserted(id)) => id,
                    Ok(InsertOutcome::Exists(_)) | Err(StoreError::ConstraintViolation(_)) => {
                        return Ok(DraftOutcome::Duplicate)
                    }
                    Err(e) => return Err(e),
                };
                if let Some(of) = self.dedup.find_earlier(&article, store).await? {
                    match store.apply(id, ArticleUpdate::MarkDuplicate { of }).await {
                        Ok(_) => return Ok(DraftOutcome::Duplicate),
                        Err(StoreError::ConstraintViolation(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                if self.classify_article(&article, Some(source)).await? {
                    Ok(DraftOutcome::Stored)
                } else {
                    Ok(DraftOutcome::Failed)
                }
            }
        }
    }

    /// Classify and write the result. `Ok(false)` when classification failed
    /// and the article was left `Failed` for a later attempt.
    async fn classify_article(
        &self,
        article: &CanonicalArticle,
        source: Option<&Source>,
    ) -> Result<bool, StoreError> {
        let input = ClassificationInput::new(article, source);
        let result = {
            let _permit = self.classify_slots.acquire().await.ok();
            self.classifier.classify(&input).await
        };
        let update = match result {
            Ok(classification) => ArticleUpdate::Classified {
                classification,
                review_threshold: self.cfg.classifier.review_threshold,
            },
            Err(e) => {
                if let Some(s) = source {
                    // Tracked apart from fetch errors; never touches health.
                    if let Err(e) = self.registry.record_classification_failure(&s.id) {
                        tracing::warn!(target: "pipeline", error = %e, "classification failure for unknown source");
                    }
                }
                ArticleUpdate::ClassificationFailed {
                    error: e.to_string(),
                }
            }
        };
        let classified = matches!(update, ArticleUpdate::Classified { .. });
        match self.store.apply(article.id, update).await {
            Ok(_) => Ok(classified),
            Err(StoreError::ConstraintViolation(msg)) => {
                tracing::debug!(target: "pipeline", article = %article.id, %msg, "classification not applied");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-attempt classification for up to `limit` pending or failed
    /// articles that are still below the per-article attempt bound.
    pub async fn reclassify_backlog(&self, limit: usize) -> ReclassifySummary {
        self.reclassify(limit, None, None).await
    }

    /// Backlog pass. `ingested_before` keeps articles from the running cycle
    /// out; past `deadline` the outstanding attempts are aborted and their
    /// articles keep their state.
    async fn reclassify(
        &self,
        limit: usize,
        ingested_before: Option<DateTime<Utc>>,
        deadline: Option<tokio::time::Instant>,
    ) -> ReclassifySummary {
        let mut summary = ReclassifySummary::default();
        if limit == 0 {
            return summary;
        }
        let candidates = match self
            .store
            .reclassify_candidates(limit, self.cfg.classifier.max_attempts_per_article)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(target: "pipeline", error = %e, "cannot read reclassification backlog");
                summary.store_unavailable = true;
                return summary;
            }
        };

        let mut set = JoinSet::new();
        for article in candidates
            .into_iter()
            .filter(|a| ingested_before.map_or(true, |t| a.ingested_at < t))
        {
            let this = self.clone();
            set.spawn(async move {
                let source = this.registry.get(&article.source_id).ok();
                this.classify_article(&article, source.as_ref()).await
            });
            summary.attempted += 1;
        }

        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(sleep);
        while !set.is_empty() {
            let joined = tokio::select! {
                biased;
                _ = &mut sleep => {
                    summary.deadline_exceeded = true;
                    break;
                }
                next = set.join_next() => match next {
                    Some(joined) => joined,
                    None => break,
                },
            };
            summary.tally(joined);
        }
        if summary.deadline_exceeded && !set.is_empty() {
            tracing::warn!(
                target: "pipeline",
                outstanding = set.len(),
                "cycle deadline reached, aborting backlog reclassification"
            );
            set.abort_all();
            while let Some(joined) = set.join_next().await {
                if !matches!(&joined, Err(je) if je.is_cancelled()) {
                    summary.tally(joined);
                }
            }
        }
        if summary.attempted > 0 {
            tracing::info!(
                target: "pipeline",
                attempted = summary.attempted,
                processed = summary.processed,
                failed = summary.failed,
                "backlog reclassified"
            );
        }
        summary
    }
}
