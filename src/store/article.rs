// src/store/article.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::Classification;
use crate::dedup::{canonical_link, content_fingerprint};
use crate::error::StoreError;
use crate::ingest::ArticleDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Pending,
    Processed,
    Failed,
    Duplicate,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 4] = [
        ProcessingState::Pending,
        ProcessingState::Processed,
        ProcessingState::Failed,
        ProcessingState::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processed => "processed",
            ProcessingState::Failed => "failed",
            ProcessingState::Duplicate => "duplicate",
        }
    }

    /// Forward-only transitions. `Failed` may be re-attempted; `Processed`
    /// may be re-classified after a substantial content update.
    pub fn can_transition(self, to: ProcessingState) -> bool {
        use ProcessingState::*;
        matches!(
            (self, to),
            (Pending, Processed)
                | (Pending, Failed)
                | (Pending, Duplicate)
                | (Failed, Processed)
                | (Failed, Failed)
                | (Processed, Processed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalArticle {
    pub id: Uuid,
    pub link: String,
    /// Uniqueness key inside the store.
    pub canonical_link: String,
    pub title: String,
    pub summary: String,
    pub fingerprint: String,
    pub source_id: String,
    pub source_name: String,
    pub classification: Option<Classification>,
    pub state: ProcessingState,
    pub requires_review: bool,
    pub classification_attempts: u32,
    pub last_error: Option<String>,
    pub duplicate_of: Option<Uuid>,
    pub raw_tags: Vec<String>,
    pub revision: u32,
    pub published_at: DateTime<Utc>,
    pub published_fallback: bool,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalArticle {
    /// Fresh `Pending` article for a draft.
    pub fn pending(draft: &ArticleDraft, source_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            link: draft.link.clone(),
            canonical_link: canonical_link(&draft.link),
            title: draft.title.clone(),
            summary: draft.summary.clone(),
            fingerprint: content_fingerprint(&draft.title, &draft.summary),
            source_id: draft.source_id.clone(),
            source_name: source_name.to_string(),
            classification: None,
            state: ProcessingState::Pending,
            requires_review: false,
            classification_attempts: 0,
            last_error: None,
            duplicate_of: None,
            raw_tags: draft.raw_tags.clone(),
            revision: 0,
            published_at: draft.published_at,
            published_fallback: draft.published_fallback,
            ingested_at: now,
            updated_at: now,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        self.classification.as_ref().map(|c| c.confidence)
    }

    pub fn importance(&self) -> Option<u8> {
        self.classification.as_ref().map(|c| c.importance)
    }

    /// Apply one update, enforcing the state machine and the review flag.
    pub fn apply(&mut self, update: ArticleUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        match update {
            ArticleUpdate::RefreshContent {
                title,
                summary,
                published_at,
                raw_tags,
            } => {
                if self.state == ProcessingState::Duplicate {
                    return Err(self.violation("refresh a duplicate"));
                }
                self.fingerprint = content_fingerprint(&title, &summary);
                self.title = title;
                self.summary = summary;
                if let Some(p) = published_at {
                    self.published_at = p;
                    self.published_fallback = false;
                }
                if !raw_tags.is_empty() {
                    self.raw_tags = raw_tags;
                }
                self.revision = self.revision.saturating_add(1);
            }
            ArticleUpdate::Classified {
                classification,
                review_threshold,
            } => {
                self.transition(ProcessingState::Processed)?;
                self.requires_review = classification.confidence < review_threshold;
                self.classification = Some(classification);
                self.classification_attempts = self.classification_attempts.saturating_add(1);
                self.last_error = None;
            }
            ArticleUpdate::ClassificationFailed { error } => {
                // A processed article keeps its previous classification.
                if self.state != ProcessingState::Processed {
                    self.transition(ProcessingState::Failed)?;
                    self.classification = None;
                    self.requires_review = false;
                }
                self.classification_attempts = self.classification_attempts.saturating_add(1);
                self.last_error = Some(error);
            }
            ArticleUpdate::MarkDuplicate { of } => {
                self.transition(ProcessingState::Duplicate)?;
                self.duplicate_of = Some(of);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    fn transition(&mut self, to: ProcessingState) -> Result<(), StoreError> {
        if !self.state.can_transition(to) {
            return Err(self.violation(&format!("{} -> {}", self.state.as_str(), to.as_str())));
        }
        self.state = to;
        Ok(())
    }

    fn violation(&self, what: &str) -> StoreError {
        StoreError::ConstraintViolation(format!("article {}: invalid transition {what}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArticleUpdate {
    RefreshContent {
        title: String,
        summary: String,
        published_at: Option<DateTime<Utc>>,
        raw_tags: Vec<String>,
    },
    Classified {
        classification: Classification,
        review_threshold: f64,
    },
    ClassificationFailed {
        error: String,
    },
    MarkDuplicate {
        of: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Category, Industry, Sentiment};

    fn draft() -> ArticleDraft {
        ArticleDraft {
            source_id: "wire".into(),
            link: "http://wire.example/a?utm_source=rss".into(),
            title: "Automaker unveils EV".into(),
            summary: "Details".into(),
            published_at: Utc::now(),
            published_fallback: false,
            raw_tags: vec![],
        }
    }

    fn classification(confidence: f64) -> Classification {
        Classification {
            industry: Industry::Automotive,
            category: Category::Launch,
            sentiment: Sentiment::Positive,
            importance: 4,
            confidence,
            tags: vec!["ev".into()],
        }
    }

    #[test]
    fn review_flag_follows_threshold() {
        let now = Utc::now();
        let mut a = CanonicalArticle::pending(&draft(), "Wire", now);
        assert_eq!(a.canonical_link, "https://wire.example/a");
        a.apply(
            ArticleUpdate::Classified {
                classification: classification(0.55),
                review_threshold: 0.6,
            },
            now,
        )
        .unwrap();
        assert_eq!(a.state, ProcessingState::Processed);
        assert!(a.requires_review);

        a.apply(
            ArticleUpdate::Classified {
                classification: classification(0.6),
                review_threshold: 0.6,
            },
            now,
        )
        .unwrap();
        assert!(!a.requires_review);
        assert_eq!(a.classification_attempts, 2);
    }

    #[test]
    fn failed_can_be_retried_but_processed_never_regresses() {
        let now = Utc::now();
        let mut a = CanonicalArticle::pending(&draft(), "Wire", now);
        a.apply(ArticleUpdate::ClassificationFailed { error: "timeout".into() }, now)
            .unwrap();
        assert_eq!(a.state, ProcessingState::Failed);
        assert!(a.classification.is_none());
        a.apply(
            ArticleUpdate::Classified {
                classification: classification(0.9),
                review_threshold: 0.6,
            },
            now,
        )
        .unwrap();
        a.apply(ArticleUpdate::ClassificationFailed { error: "again".into() }, now)
            .unwrap();
        assert_eq!(a.state, ProcessingState::Processed);
        assert!(a.classification.is_some());
        assert!(matches!(
            a.apply(ArticleUpdate::MarkDuplicate { of: Uuid::new_v4() }, now),
            Err(StoreError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn duplicates_are_terminal() {
        let now = Utc::now();
        let mut a = CanonicalArticle::pending(&draft(), "Wire", now);
        a.apply(ArticleUpdate::MarkDuplicate { of: Uuid::new_v4() }, now)
            .unwrap();
        let refresh = ArticleUpdate::RefreshContent {
            title: "x".into(),
            summary: "y".into(),
            published_at: None,
            raw_tags: vec![],
        };
        assert!(a.apply(refresh, now).is_err());
        assert!(!ProcessingState::Duplicate.can_transition(ProcessingState::Processed));
    }
}
