//! # Deduplicator
//! Decides whether a draft is new, an update of a stored article, or a
//! duplicate to discard.
//!
//! The decision is advisory: the store's atomic insert-if-absent on the
//! canonical link has the last word when two cycles race on the same link.

use chrono::Duration;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use url::Url;
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::error::StoreError;
use crate::ingest::ArticleDraft;
use crate::store::{ArticleStore, CanonicalArticle, ProcessingState};

/// Query parameters that only carry campaign/click tracking.
static TRACKING_PARAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "fbclid",
        "gclid", "ref", "source", "campaign", "medium", "_ga", "_gl", "mc_cid", "mc_eid",
        "pk_source", "pk_campaign", "yclid", "gclsrc", "dclid", "msclkid",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    New,
    /// Same canonical link, different content. `substantial` asks for a
    /// fresh classification.
    UpdateOf { id: Uuid, substantial: bool },
    Duplicate { of: Uuid },
}

/// Normalized link used as the uniqueness key.
///
/// https, lowercase host, no fragment, no tracking params, no trailing
/// slash. Links that do not parse are only trimmed.
pub fn canonical_link(link: &str) -> String {
    let trimmed = link.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_string();
    };
    if url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(k.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut out = url.to_string();
    if url.query().is_none() {
        while out.ends_with('/') && !out.ends_with("://") {
            out.pop();
        }
    }
    out
}

/// Lowercase, punctuation to spaces, collapsed whitespace.
fn fold_text(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: String, n: usize) -> String {
    if s.chars().count() <= n {
        s
    } else {
        s.chars().take(n).collect()
    }
}

/// Folded title capped at 120 chars.
pub fn normalize_title(title: &str) -> String {
    truncate_chars(fold_text(title), 120)
}

/// Similarity of two already-normalized strings in 0..=1: the better of
/// edit-distance similarity and word overlap (Jaccard), so reordered
/// headlines still match.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let lev = strsim::normalized_levenshtein(a, b);
    let wa: HashSet<&str> = a.split_whitespace().collect();
    let wb: HashSet<&str> = b.split_whitespace().collect();
    let union = wa.union(&wb).count();
    let jaccard = if union == 0 {
        0.0
    } else {
        wa.intersection(&wb).count() as f64 / union as f64
    };
    lev.max(jaccard)
}

/// SHA-256 over normalized title and summary, hex encoded.
pub fn content_fingerprint(title: &str, summary: &str) -> String {
    let text = truncate_chars(format!("{} {}", fold_text(title), fold_text(summary)), 500);
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    cfg: DedupConfig,
}

impl Deduplicator {
    pub fn new(cfg: DedupConfig) -> Self {
        Self { cfg }
    }

    pub async fn classify(
        &self,
        draft: &ArticleDraft,
        store: &dyn ArticleStore,
    ) -> Result<Decision, StoreError> {
        let link = canonical_link(&draft.link);
        if let Some(existing) = store.find_by_link(&link).await? {
            return Ok(self.compare(draft, &existing));
        }

        let window = Duration::hours(self.cfg.near_duplicate_window_hours);
        let candidates = store
            .recent_from_source(&draft.source_id, draft.published_at - window, draft.published_at + window)
            .await?;
        let title = normalize_title(&draft.title);
        let near = candidates.iter().find(|a| {
            similarity(&title, &normalize_title(&a.title)) >= self.cfg.title_similarity_threshold
        });
        Ok(match near {
            Some(a) => Decision::Duplicate { of: a.id },
            None => Decision::New,
        })
    }

    /// Near-duplicate of `article` that was stored before it. Two pipelines
    /// racing on look-alike items under different links both pass
    /// [`Deduplicator::classify`]; this lets the later one step back.
    pub async fn find_earlier(
        &self,
        article: &CanonicalArticle,
        store: &dyn ArticleStore,
    ) -> Result<Option<Uuid>, StoreError> {
        let window = Duration::hours(self.cfg.near_duplicate_window_hours);
        let candidates = store
            .recent_from_source(
                &article.source_id,
                article.published_at - window,
                article.published_at + window,
            )
            .await?;
        let title = normalize_title(&article.title);
        Ok(candidates
            .iter()
            .filter(|a| a.id != article.id)
            .filter(|a| (a.ingested_at, a.id) < (article.ingested_at, article.id))
            .find(|a| {
                similarity(&title, &normalize_title(&a.title))
                    >= self.cfg.title_similarity_threshold
            })
            .map(|a| a.id))
    }

    /// Exact-link match: unchanged content is a duplicate, anything else an update.
    pub fn compare(&self, draft: &ArticleDraft, existing: &CanonicalArticle) -> Decision {
        if existing.state == ProcessingState::Duplicate {
            return Decision::Duplicate { of: existing.id };
        }
        if content_fingerprint(&draft.title, &draft.summary) == existing.fingerprint {
            return Decision::Duplicate { of: existing.id };
        }
        let title_sim = similarity(&normalize_title(&draft.title), &normalize_title(&existing.title));
        let summary_sim = similarity(
            &truncate_chars(fold_text(&draft.summary), 500),
            &truncate_chars(fold_text(&existing.summary), 500),
        );
        let substantial = title_sim < self.cfg.substantial_title_similarity
            || summary_sim < self.cfg.substantial_summary_similarity;
        Decision::UpdateOf {
            id: existing.id,
            substantial,
        }
    }
}
