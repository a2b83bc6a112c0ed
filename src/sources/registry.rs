// src/sources/registry.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::health::OutcomeWindow;
use super::{Source, SourceOutcome};
use crate::config::{HealthConfig, SourceSeed};
use crate::error::NotFound;

/// Exclusive owner of source records.
///
/// The outer lock only guards the set of sources; each source has its own
/// mutex so outcomes for different sources never contend, while two
/// outcomes for the same source are applied one after the other.
#[derive(Debug)]
pub struct SourceRegistry {
    entries: RwLock<Entries>,
    health: HealthConfig,
}

#[derive(Debug, Default)]
struct Entries {
    order: Vec<String>,
    by_id: HashMap<String, Arc<Mutex<SourceState>>>,
}

#[derive(Debug)]
struct SourceState {
    source: Source,
    window: OutcomeWindow,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceCounts {
    pub total: usize,
    pub active: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

impl SourceRegistry {
    pub fn new(health: HealthConfig) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            health,
        }
    }

    pub fn from_seeds(seeds: &[SourceSeed], health: HealthConfig) -> Self {
        let reg = Self::new(health);
        for seed in seeds {
            if reg.register(seed).is_none() {
                tracing::warn!(id = %seed.stable_id(), "source already registered, skipping seed");
            }
        }
        reg
    }

    /// Add a source at runtime. Returns `None` when the id is taken.
    pub fn register(&self, seed: &SourceSeed) -> Option<Source> {
        let source = Source::from_seed(seed);
        let mut entries = self.entries.write().expect("source registry lock poisoned");
        if entries.by_id.contains_key(&source.id) {
            return None;
        }
        let state = SourceState {
            source: source.clone(),
            window: OutcomeWindow::with_capacity(self.health.window),
        };
        entries.order.push(source.id.clone());
        entries
            .by_id
            .insert(source.id.clone(), Arc::new(Mutex::new(state)));
        tracing::info!(target: "pipeline", source = %source.id, "source registered");
        Some(source)
    }

    fn handle(&self, id: &str) -> Result<Arc<Mutex<SourceState>>, NotFound> {
        let entries = self.entries.read().expect("source registry lock poisoned");
        entries
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| NotFound(id.to_string()))
    }

    fn snapshot_all(&self) -> Vec<Source> {
        let entries = self.entries.read().expect("source registry lock poisoned");
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id))
            .map(|h| {
                h.lock()
                    .expect("source state mutex poisoned")
                    .source
                    .clone()
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Source, NotFound> {
        let h = self.handle(id)?;
        let st = h.lock().expect("source state mutex poisoned");
        Ok(st.source.clone())
    }

    /// All sources in registration order.
    pub fn list_all(&self) -> Vec<Source> {
        self.snapshot_all()
    }

    pub fn list_active(&self) -> Vec<Source> {
        self.snapshot_all()
            .into_iter()
            .filter(|s| s.is_active)
            .collect()
    }

    /// Active sources that should be fetched this cycle: healthy ones, plus
    /// unhealthy ones whose last fetch is at least `retry_after` old.
    pub fn list_dispatchable(&self, now: DateTime<Utc>, retry_after: Duration) -> Vec<Source> {
        let retry_after =
            chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());
        self.list_active()
            .into_iter()
            .filter(|s| {
                s.is_healthy
                    || s
                        .last_fetched_at
                        .map_or(true, |at| now.signed_duration_since(at) >= retry_after)
            })
            .collect()
    }

    /// Fold one fetch outcome into the source as a single transition.
    pub fn record_outcome(&self, id: &str, outcome: SourceOutcome) -> Result<Source, NotFound> {
        self.record_outcome_at(id, outcome, None, Utc::now())
    }

    pub fn record_outcome_at(
        &self,
        id: &str,
        outcome: SourceOutcome,
        elapsed: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Source, NotFound> {
        let h = self.handle(id)?;
        let mut st = h.lock().expect("source state mutex poisoned");
        let max_error_rate = self.health.max_error_rate;
        let was_healthy = st.source.is_healthy;

        st.window.record(outcome.is_success());
        let rate = st.window.error_rate();

        let src = &mut st.source;
        src.last_fetched_at = Some(now);
        match &outcome {
            SourceOutcome::Success(_) => {
                src.success_count += 1;
                src.consecutive_failures = 0;
                src.last_error = None;
                if let Some(d) = elapsed {
                    let ms = d.as_secs_f64() * 1_000.0;
                    let n = src.success_count as f64;
                    src.avg_response_ms = Some(match src.avg_response_ms {
                        Some(avg) => avg + (ms - avg) / n,
                        None => ms,
                    });
                }
            }
            SourceOutcome::Failure(err) => {
                src.error_count += 1;
                src.consecutive_failures = src.consecutive_failures.saturating_add(1);
                src.last_error = Some(err.to_string());
            }
        }
        src.recent_error_rate = rate;
        src.is_healthy = src.is_active && rate <= max_error_rate;

        if was_healthy != src.is_healthy {
            tracing::warn!(
                target: "pipeline",
                source = %src.id,
                healthy = src.is_healthy,
                error_rate = rate,
                "source health changed"
            );
        }
        Ok(src.clone())
    }

    /// Classification failures are kept apart from fetch counters and never
    /// affect health.
    pub fn record_classification_failure(&self, id: &str) -> Result<(), NotFound> {
        let h = self.handle(id)?;
        let mut st = h.lock().expect("source state mutex poisoned");
        st.source.classification_failures += 1;
        Ok(())
    }

    /// Operator switch. Deactivated sources stay listed but are never fetched.
    pub fn set_active(&self, id: &str, active: bool) -> Result<Source, NotFound> {
        let h = self.handle(id)?;
        let mut st = h.lock().expect("source state mutex poisoned");
        let rate = st.window.error_rate();
        st.source.is_active = active;
        st.source.is_healthy = active && rate <= self.health.max_error_rate;
        tracing::info!(target: "pipeline", source = %id, active, "source activation changed");
        Ok(st.source.clone())
    }

    pub fn counts(&self) -> SourceCounts {
        let all = self.snapshot_all();
        let active = all.iter().filter(|s| s.is_active).count();
        let healthy = all.iter().filter(|s| s.is_active && s.is_healthy).count();
        SourceCounts {
            total: all.len(),
            active,
            healthy,
            unhealthy: active - healthy,
        }
    }

    /// Source that most recently reported an outcome.
    pub fn last_fetched(&self) -> Option<Source> {
        self.snapshot_all()
            .into_iter()
            .filter(|s| s.last_fetched_at.is_some())
            .max_by_key(|s| s.last_fetched_at)
    }
}
