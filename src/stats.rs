//! # Health & Stats
//! Rolls per-source health, article counts and the last cycle report up
//! into one snapshot, and derives the system status from them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::HealthConfig;
use crate::orchestrator::CycleReport;
use crate::sources::{SourceCounts, SourceRegistry};
use crate::store::{ArticleCounts, ArticleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Healthy => "healthy",
            SystemStatus::Degraded => "degraded",
            SystemStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub status: SystemStatus,
    pub timestamp: DateTime<Utc>,
    pub article_counts: ArticleCounts,
    pub source_counts: SourceCounts,
    pub classification_failures: u64,
    pub cycles_run: u64,
    pub last_cycle_report: Option<CycleReport>,
    /// Set when the store could not be read for this snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

#[derive(Debug)]
pub struct StatsAggregator {
    health: HealthConfig,
    last: RwLock<Option<CycleReport>>,
    cycles: AtomicU64,
}

impl StatsAggregator {
    pub fn new(health: HealthConfig) -> Self {
        Self {
            health,
            last: RwLock::new(None),
            cycles: AtomicU64::new(0),
        }
    }

    /// Keep the most recently finished cycle. Overlapping cycles may finish
    /// out of order, so an older report never replaces a newer one.
    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.write().expect("stats lock poisoned");
        let newer = last
            .as_ref()
            .map_or(true, |prev| report.finished_at >= prev.finished_at);
        if newer {
            *last = Some(report.clone());
        }
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.last.read().expect("stats lock poisoned").clone()
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn status(
        &self,
        sources: &SourceCounts,
        last: Option<&CycleReport>,
        store_ok: bool,
    ) -> SystemStatus {
        derive_status(&self.health, sources, last, store_ok)
    }

    pub async fn snapshot(&self, registry: &SourceRegistry, store: &dyn ArticleStore) -> Stats {
        let source_counts = registry.counts();
        let classification_failures = registry
            .list_all()
            .iter()
            .map(|s| s.classification_failures)
            .sum();
        let (article_counts, store_error) = match store.counts().await {
            Ok(c) => (c, None),
            Err(e) => (ArticleCounts::default(), Some(e.to_string())),
        };
        let last = self.last_cycle();
        Stats {
            status: self.status(&source_counts, last.as_ref(), store_error.is_none()),
            timestamp: Utc::now(),
            article_counts,
            source_counts,
            classification_failures,
            cycles_run: self.cycles_run(),
            last_cycle_report: last,
            store_error,
        }
    }
}

/// * unhealthy: store down, last cycle failed entirely, or fewer than
///   `unhealthy_fraction` of active sources healthy
/// * healthy: at least `healthy_fraction` healthy and last cycle failure
///   rate below `max_cycle_failure_rate`
/// * degraded: everything else, including no active sources at all
pub fn derive_status(
    cfg: &HealthConfig,
    sources: &SourceCounts,
    last: Option<&CycleReport>,
    store_ok: bool,
) -> SystemStatus {
    if !store_ok {
        return SystemStatus::Unhealthy;
    }
    if last.is_some_and(|r| r.store_unavailable || r.failed_entirely()) {
        return SystemStatus::Unhealthy;
    }
    if sources.active == 0 {
        return SystemStatus::Degraded;
    }
    let healthy_fraction = sources.healthy as f64 / sources.active as f64;
    if healthy_fraction < cfg.unhealthy_fraction {
        return SystemStatus::Unhealthy;
    }
    let cycle_ok = last.map_or(true, |r| r.failure_rate() < cfg.max_cycle_failure_rate);
    if healthy_fraction >= cfg.healthy_fraction && cycle_ok {
        SystemStatus::Healthy
    } else {
        SystemStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(active: usize, healthy: usize) -> SourceCounts {
        SourceCounts {
            total: active,
            active,
            healthy,
            unhealthy: active - healthy,
        }
    }

    fn report(attempted: usize, failed: usize) -> CycleReport {
        let mut r = CycleReport::empty(Utc::now());
        r.sources_attempted = attempted;
        r.sources_failed = failed;
        r
    }

    #[test]
    fn status_thresholds() {
        let cfg = HealthConfig::default();
        assert_eq!(derive_status(&cfg, &counts(10, 9), None, true), SystemStatus::Healthy);
        assert_eq!(derive_status(&cfg, &counts(10, 8), None, true), SystemStatus::Healthy);
        assert_eq!(derive_status(&cfg, &counts(10, 7), None, true), SystemStatus::Degraded);
        assert_eq!(derive_status(&cfg, &counts(10, 5), None, true), SystemStatus::Degraded);
        assert_eq!(derive_status(&cfg, &counts(10, 4), None, true), SystemStatus::Unhealthy);
        assert_eq!(derive_status(&cfg, &counts(0, 0), None, true), SystemStatus::Degraded);
        assert_eq!(derive_status(&cfg, &counts(10, 10), None, false), SystemStatus::Unhealthy);
    }

    #[test]
    fn last_cycle_drives_status() {
        let cfg = HealthConfig::default();
        let all = counts(4, 4);
        assert_eq!(
            derive_status(&cfg, &all, Some(&report(4, 1)), true),
            SystemStatus::Healthy
        );
        assert_eq!(
            derive_status(&cfg, &all, Some(&report(4, 2)), true),
            SystemStatus::Degraded
        );
        assert_eq!(
            derive_status(&cfg, &all, Some(&report(4, 4)), true),
            SystemStatus::Unhealthy
        );
        let mut down = report(4, 0);
        down.store_unavailable = true;
        assert_eq!(derive_status(&cfg, &all, Some(&down), true), SystemStatus::Unhealthy);
    }

    #[test]
    fn older_report_does_not_replace_newer() {
        let agg = StatsAggregator::new(HealthConfig::default());
        let newer = report(2, 0);
        let mut older = report(1, 1);
        older.finished_at = newer.finished_at - chrono::Duration::seconds(5);
        agg.record_cycle(&newer);
        agg.record_cycle(&older);
        assert_eq!(agg.last_cycle().unwrap().sources_attempted, 2);
        assert_eq!(agg.cycles_run(), 2);
    }
}
