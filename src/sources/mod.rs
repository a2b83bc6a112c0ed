// src/sources/mod.rs
pub mod health;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SourceSeed;
use crate::error::FetchError;

pub use registry::{SourceCounts, SourceRegistry};

/// A configured feed plus its live health and counters.
///
/// Only the registry mutates these; everything else sees cloned snapshots.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    pub website: String,
    pub feed_url: String,
    pub region: String,
    pub language: String,
    /// Static 0..=10.
    pub credibility: f64,
    /// Static 0..=10.
    pub topical_focus: f64,
    pub specialties: Vec<String>,
    pub is_active: bool,
    pub is_healthy: bool,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub classification_failures: u64,
    pub recent_error_rate: f64,
    pub avg_response_ms: Option<f64>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Source {
    pub fn from_seed(seed: &SourceSeed) -> Self {
        Self {
            id: seed.stable_id(),
            name: seed.name.trim().to_string(),
            website: seed.website.trim().to_string(),
            feed_url: seed.rss_feed.trim().to_string(),
            region: seed.region.clone(),
            language: seed.language.to_ascii_lowercase(),
            credibility: seed.credibility.value(),
            topical_focus: seed.automotive_focus.value(),
            specialties: seed.specialties.clone(),
            is_active: seed.is_active,
            is_healthy: seed.is_active,
            success_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            classification_failures: 0,
            recent_error_rate: 0.0,
            avg_response_ms: None,
            last_fetched_at: None,
            last_error: None,
        }
    }
}

/// Result of one dispatched source pipeline in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Success(usize),
    Failure(FetchError),
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceOutcome::Success(_))
    }
}
