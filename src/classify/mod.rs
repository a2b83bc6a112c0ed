// src/classify/mod.rs
//! Classification capability and its backends.
//!
//! The orchestrator only sees `dyn Classifier`; which backend runs (keyword
//! rules, external inference, a fixed mock) is decided by configuration in
//! [`build_classifier`].

pub mod openai;
pub mod retrying;
pub mod rules;
pub mod scoring;

use async_trait::async_trait;
use metrics::{describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{ClassifierConfig, ClassifierKind};
use crate::error::ClassificationError;
use crate::sources::Source;
use crate::store::CanonicalArticle;

pub use openai::OpenAiClassifier;
pub use retrying::{CachingClassifier, RetryingClassifier};
pub use rules::RuleClassifier;

pub const MAX_TAGS: usize = 10;

pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("classify_attempts_total", "Classifier calls, retries included.");
        describe_counter!("classify_failures_total", "Classifications that failed after all retries.");
        describe_counter!("classify_cache_hits_total", "Classifications served from the cache.");
        describe_histogram!("classify_ms", "Classifier latency in milliseconds.");
    });
}

macro_rules! labeled_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            /// Case-insensitive.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| format!("unknown {}: {s}", stringify!($name)))
            }
        }
    };
}

labeled_enum!(Industry {
    Automotive => "Automotive",
    Hvac => "HVAC",
    Finance => "Finance",
    Healthcare => "Healthcare",
    Energy => "Energy",
    Tech => "Tech",
    Unknown => "Unknown",
});

labeled_enum!(Category {
    Launch => "Launch",
    Financials => "Financials",
    Competitor => "Competitor",
    Regulation => "Regulation",
    Research => "Research",
    Opinion => "Opinion",
    Other => "Other",
});

labeled_enum!(Sentiment {
    Positive => "positive",
    Negative => "negative",
    Neutral => "neutral",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub industry: Industry,
    pub category: Category,
    pub sentiment: Sentiment,
    /// 1 (minor) ..= 5 (major).
    pub importance: u8,
    /// 0..=1.
    pub confidence: f64,
    pub tags: Vec<String>,
}

impl Classification {
    /// Reject out-of-range scores; trim, lowercase, dedup and cap tags.
    pub fn validated(mut self) -> Result<Self, ClassificationError> {
        if !(1..=5).contains(&self.importance) {
            return Err(ClassificationError::InvalidResponse(format!(
                "importance {} outside 1..=5",
                self.importance
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ClassificationError::InvalidResponse(format!(
                "confidence {} outside 0..=1",
                self.confidence
            )));
        }
        let mut tags: Vec<String> = Vec::with_capacity(self.tags.len().min(MAX_TAGS));
        for t in self.tags.drain(..) {
            let t = t.trim().to_lowercase();
            if !t.is_empty() && !tags.contains(&t) {
                tags.push(t);
            }
            if tags.len() == MAX_TAGS {
                break;
            }
        }
        self.tags = tags;
        Ok(self)
    }
}

/// What a classifier gets to see. Identical input yields identical output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationInput {
    pub title: String,
    pub summary: String,
    pub source_name: String,
    /// 0..=10.
    pub source_credibility: f64,
    /// 0..=10.
    pub source_focus: f64,
    pub raw_tags: Vec<String>,
}

impl ClassificationInput {
    pub fn new(article: &CanonicalArticle, source: Option<&Source>) -> Self {
        Self {
            title: article.title.clone(),
            summary: article.summary.clone(),
            source_name: article.source_name.clone(),
            source_credibility: source.map_or(5.0, |s| s.credibility),
            source_focus: source.map_or(5.0, |s| s.topical_focus),
            raw_tags: article.raw_tags.clone(),
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError>;

    fn name(&self) -> &'static str;
}

pub type DynClassifier = Arc<dyn Classifier>;

/// Always returns the same classification; for local runs and tests.
#[derive(Debug, Clone)]
pub struct StaticClassifier {
    pub fixed: Classification,
}

impl Default for StaticClassifier {
    fn default() -> Self {
        Self {
            fixed: Classification {
                industry: Industry::Unknown,
                category: Category::Other,
                sentiment: Sentiment::Neutral,
                importance: 3,
                confidence: 0.75,
                tags: vec!["mock".to_string()],
            },
        }
    }
}

#[async_trait]
impl Classifier for StaticClassifier {
    async fn classify(
        &self,
        _input: &ClassificationInput,
    ) -> Result<Classification, ClassificationError> {
        Ok(self.fixed.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory: build a classifier according to config and environment.
///
/// * `AI_TEST_MODE=mock` yields a deterministic fixed classifier.
/// * `kind = "rules"` yields the keyword classifier.
/// * `kind = "openai"` yields the external backend behind retries and a
///   result cache, or the keyword classifier when no API key is set.
pub fn build_classifier(cfg: &ClassifierConfig) -> anyhow::Result<DynClassifier> {
    let timeout = cfg.timeout();
    let policy = cfg.retry_policy();

    if std::env::var("AI_TEST_MODE").is_ok_and(|v| v == "mock") {
        return Ok(Arc::new(RetryingClassifier::new(
            StaticClassifier::default(),
            timeout,
            policy,
        )));
    }

    match cfg.kind {
        ClassifierKind::Rules => Ok(Arc::new(RetryingClassifier::new(
            RuleClassifier::new(),
            timeout,
            policy,
        ))),
        ClassifierKind::Openai => {
            let key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            if key.trim().is_empty() {
                tracing::warn!(
                    target: "classify",
                    "OPENAI_API_KEY missing, falling back to rule classifier"
                );
                return Ok(Arc::new(RetryingClassifier::new(
                    RuleClassifier::new(),
                    timeout,
                    policy,
                )));
            }
            let backend = OpenAiClassifier::new(cfg, key)?;
            Ok(Arc::new(CachingClassifier::new(RetryingClassifier::new(
                backend, timeout, policy,
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_case_insensitively() {
        assert_eq!("hvac".parse::<Industry>().unwrap(), Industry::Hvac);
        assert_eq!(Industry::Hvac.to_string(), "HVAC");
        assert_eq!(" launch ".parse::<Category>().unwrap(), Category::Launch);
        assert!("gossip".parse::<Category>().is_err());
        assert_eq!(
            serde_json::to_string(&Sentiment::Negative).unwrap(),
            "\"negative\""
        );
    }

    #[test]
    fn validation_caps_tags_and_rejects_ranges() {
        let mut c = StaticClassifier::default().fixed;
        c.tags = (0..15).map(|i| format!(" Tag{} ", i % 12)).collect();
        let v = c.clone().validated().unwrap();
        assert_eq!(v.tags.len(), MAX_TAGS);
        assert_eq!(v.tags[0], "tag0");

        let mut bad = c.clone();
        bad.importance = 0;
        assert!(bad.validated().is_err());
        let mut bad = c;
        bad.confidence = 1.2;
        assert!(matches!(
            bad.validated(),
            Err(ClassificationError::InvalidResponse(_))
        ));
    }
}
