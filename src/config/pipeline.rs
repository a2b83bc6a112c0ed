// src/config/pipeline.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::retry::RetryPolicy;

pub const ENV_PIPELINE_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_PIPELINE_CONFIG_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fetch: FetchConfig,
    pub orchestrator: OrchestratorConfig,
    pub health: HealthConfig,
    pub dedup: DedupConfig,
    pub classifier: ClassifierConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub user_agent: String,
    pub max_items_per_source: usize,
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            user_agent: concat!("newsdesk/", env!("CARGO_PKG_VERSION"), " (+feed ingestion)")
                .to_string(),
            max_items_per_source: 50,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base_ms, self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_in_flight_sources: usize,
    pub max_in_flight_classifications: usize,
    pub cycle_deadline_secs: u64,
    pub interval_secs: u64,
    pub unhealthy_retry_after_secs: u64,
    pub reclassify_per_cycle: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight_sources: 8,
            max_in_flight_classifications: 4,
            cycle_deadline_secs: 120,
            interval_secs: 1_800,
            unhealthy_retry_after_secs: 900,
            reclassify_per_cycle: 20,
        }
    }
}

impl OrchestratorConfig {
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs.max(1))
    }

    pub fn unhealthy_retry_after(&self) -> Duration {
        Duration::from_secs(self.unhealthy_retry_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of most recent fetch outcomes considered per source.
    pub window: usize,
    /// Healthy iff error rate over the window is at or below this.
    pub max_error_rate: f64,
    pub healthy_fraction: f64,
    pub unhealthy_fraction: f64,
    pub max_cycle_failure_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 10,
            max_error_rate: 0.5,
            healthy_fraction: 0.8,
            unhealthy_fraction: 0.5,
            max_cycle_failure_rate: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub near_duplicate_window_hours: i64,
    pub title_similarity_threshold: f64,
    /// Below this title similarity an update counts as substantial.
    pub substantial_title_similarity: f64,
    pub substantial_summary_similarity: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_window_hours: 48,
            title_similarity_threshold: 0.9,
            substantial_title_similarity: 0.8,
            substantial_summary_similarity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    #[default]
    Rules,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub kind: ClassifierKind,
    pub review_threshold: f64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_attempts_per_article: u32,
    pub model: String,
    pub endpoint: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::Rules,
            review_threshold: 0.6,
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 16_000,
            max_attempts_per_article: 3,
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base_ms, self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot of all articles; in-memory only when absent.
    pub snapshot_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config toml")?;
        Ok(cfg.sanitized())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Resolve config using env var + fallbacks, then apply env overrides:
    /// 1) $PIPELINE_CONFIG_PATH (must exist)
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let base = if let Ok(p) = env::var(ENV_PIPELINE_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!(
                    "{ENV_PIPELINE_CONFIG_PATH} points to non-existent path {}",
                    pb.display()
                ));
            }
            Self::load_from(&pb)?
        } else {
            let p = PathBuf::from(DEFAULT_PIPELINE_CONFIG_PATH);
            if p.exists() {
                Self::load_from(&p)?
            } else {
                Self::default()
            }
        };
        Ok(base.with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(kind) = env::var("CLASSIFIER_KIND") {
            match kind.trim().to_ascii_lowercase().as_str() {
                "rules" => self.classifier.kind = ClassifierKind::Rules,
                "openai" => self.classifier.kind = ClassifierKind::Openai,
                other => tracing::warn!(kind = other, "unknown CLASSIFIER_KIND, ignoring"),
            }
        }
        if let Some(v) = env_parse::<f64>("REVIEW_THRESHOLD") {
            self.classifier.review_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("INGEST_INTERVAL_SECS") {
            self.orchestrator.interval_secs = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_IN_FLIGHT_SOURCES") {
            self.orchestrator.max_in_flight_sources = v;
        }
        self.sanitized()
    }

    fn sanitized(mut self) -> Self {
        let c = &mut self.classifier;
        c.review_threshold = if c.review_threshold.is_finite() {
            c.review_threshold.clamp(0.0, 1.0)
        } else {
            ClassifierConfig::default().review_threshold
        };
        c.max_attempts_per_article = c.max_attempts_per_article.max(1);

        let o = &mut self.orchestrator;
        o.max_in_flight_sources = o.max_in_flight_sources.max(1);
        o.max_in_flight_classifications = o.max_in_flight_classifications.max(1);

        let h = &mut self.health;
        h.window = h.window.max(1);
        h.max_error_rate = h.max_error_rate.clamp(0.0, 1.0);
        if h.unhealthy_fraction > h.healthy_fraction {
            std::mem::swap(&mut h.unhealthy_fraction, &mut h.healthy_fraction);
        }

        self.dedup.title_similarity_threshold = self.dedup.title_similarity_threshold.clamp(0.0, 1.0);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
            [fetch]
            timeout_secs = 3

            [classifier]
            kind = "openai"
            review_threshold = 1.7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fetch.timeout_secs, 3);
        assert_eq!(cfg.fetch.max_retries, 3);
        assert_eq!(cfg.classifier.kind, ClassifierKind::Openai);
        assert_eq!(cfg.classifier.review_threshold, 1.0);
        assert_eq!(cfg.health.window, 10);
        assert_eq!(cfg.dedup.near_duplicate_window_hours, 48);
    }

    #[test]
    fn fractions_are_ordered() {
        let cfg = PipelineConfig::from_toml_str(
            "[health]\nhealthy_fraction = 0.4\nunhealthy_fraction = 0.9\n",
        )
        .unwrap();
        assert!(cfg.health.unhealthy_fraction <= cfg.health.healthy_fraction);
    }
}
