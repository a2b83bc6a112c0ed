// src/store/memory.rs
//! In-memory article store with an optional JSON snapshot on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

use super::{
    ArticleCounts, ArticlePage, ArticleQuery, ArticleStore, ArticleUpdate, CanonicalArticle,
    InsertOutcome, ProcessingState, SortKey, SortOrder,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Inner {
    articles: HashMap<Uuid, CanonicalArticle>,
    by_link: HashMap<String, Uuid>,
}

impl Inner {
    fn insert(&mut self, article: CanonicalArticle) -> InsertOutcome {
        if let Some(existing) = self.by_link.get(&article.canonical_link) {
            return InsertOutcome::Exists(*existing);
        }
        let id = article.id;
        self.by_link.insert(article.canonical_link.clone(), id);
        self.articles.insert(id, article);
        InsertOutcome::Inserted(id)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a snapshot file; loads it when present.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut inner = Inner::default();
        if path.exists() {
            let data = fs::read_to_string(&path).map_err(|e| unavailable(&path, e))?;
            let articles: Vec<CanonicalArticle> = serde_json::from_str(&data).map_err(|e| {
                StoreError::Unavailable(format!("snapshot {} unreadable: {e}", path.display()))
            })?;
            for a in articles {
                if let InsertOutcome::Exists(_) = inner.insert(a) {
                    tracing::warn!(target: "pipeline", "snapshot holds a duplicate link, dropped");
                }
            }
            tracing::info!(
                target: "pipeline",
                articles = inner.articles.len(),
                path = %path.display(),
                "article snapshot loaded"
            );
        }
        Ok(Self {
            inner: RwLock::new(inner),
            snapshot_path: Some(path),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("article store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("article store lock poisoned".into()))
    }
}

fn unavailable(path: &Path, e: io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {e}", path.display()))
}

/// Atomic replace: write to a sibling tmp file, then rename over the target.
fn write_snapshot(path: &Path, articles: &[CanonicalArticle]) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(articles).map_err(io::Error::other)?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&json)?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn compare(a: &CanonicalArticle, b: &CanonicalArticle, key: SortKey) -> Ordering {
    let primary = match key {
        SortKey::PublishedAt => a.published_at.cmp(&b.published_at),
        SortKey::IngestedAt => a.ingested_at.cmp(&b.ingested_at),
        SortKey::Importance => a.importance().cmp(&b.importance()),
        SortKey::Confidence => a
            .confidence()
            .partial_cmp(&b.confidence())
            .unwrap_or(Ordering::Equal),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

fn matches(a: &CanonicalArticle, q: &ArticleQuery) -> bool {
    let state_ok = match q.state {
        Some(s) => a.state == s,
        None => a.state != ProcessingState::Duplicate,
    };
    let class = a.classification.as_ref();
    state_ok
        && q.industry.map_or(true, |i| class.is_some_and(|c| c.industry == i))
        && q.category.map_or(true, |c| class.is_some_and(|x| x.category == c))
        && q.requires_review.map_or(true, |r| a.requires_review == r)
        && q.source.as_deref().map_or(true, |s| a.source_id == s)
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        article: CanonicalArticle,
    ) -> Result<InsertOutcome, StoreError> {
        Ok(self.write()?.insert(article))
    }

    async fn get(&self, id: Uuid) -> Result<Option<CanonicalArticle>, StoreError> {
        Ok(self.read()?.articles.get(&id).cloned())
    }

    async fn find_by_link(
        &self,
        canonical_link: &str,
    ) -> Result<Option<CanonicalArticle>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_link
            .get(canonical_link)
            .and_then(|id| inner.articles.get(id))
            .cloned())
    }

    async fn recent_from_source(
        &self,
        source_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalArticle>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .articles
            .values()
            .filter(|a| {
                a.source_id == source_id
                    && a.state != ProcessingState::Duplicate
                    && a.published_at >= from
                    && a.published_at <= to
            })
            .cloned()
            .collect())
    }

    async fn apply(
        &self,
        id: Uuid,
        update: ArticleUpdate,
    ) -> Result<CanonicalArticle, StoreError> {
        let mut inner = self.write()?;
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| StoreError::ConstraintViolation(format!("unknown article {id}")))?;
        article.apply(update, Utc::now())?;
        Ok(article.clone())
    }

    async fn list(&self, query: &ArticleQuery) -> Result<ArticlePage, StoreError> {
        let limit = query.limit.clamp(1, ArticleQuery::MAX_LIMIT);
        let page = query.page.max(1);
        let inner = self.read()?;
        let mut hits: Vec<&CanonicalArticle> =
            inner.articles.values().filter(|a| matches(a, query)).collect();
        hits.sort_by(|a, b| {
            let ord = compare(a, b, query.sort_by);
            match query.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        let total = hits.len();
        let items = hits
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect();
        Ok(ArticlePage {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        })
    }

    async fn reclassify_candidates(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<CanonicalArticle>, StoreError> {
        let inner = self.read()?;
        let mut out: Vec<CanonicalArticle> = inner
            .articles
            .values()
            .filter(|a| match a.state {
                ProcessingState::Pending => true,
                ProcessingState::Failed => a.classification_attempts < max_attempts,
                _ => false,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then_with(|| a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn counts(&self) -> Result<ArticleCounts, StoreError> {
        let inner = self.read()?;
        let mut c = ArticleCounts {
            total: inner.articles.len(),
            ..ArticleCounts::default()
        };
        for s in ProcessingState::ALL {
            c.by_state.insert(s.as_str().to_string(), 0);
        }
        for a in inner.articles.values() {
            *c.by_state.entry(a.state.as_str().to_string()).or_default() += 1;
            if a.requires_review {
                c.requires_review += 1;
            }
            if let Some(cl) = &a.classification {
                *c.by_industry.entry(cl.industry.to_string()).or_default() += 1;
                *c.by_category.entry(cl.category.to_string()).or_default() += 1;
            }
        }
        Ok(c)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let mut articles: Vec<CanonicalArticle> =
            self.read()?.articles.values().cloned().collect();
        articles.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then_with(|| a.id.cmp(&b.id)));
        let count = articles.len();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&target, &articles))
            .await
            .map_err(|e| StoreError::Unavailable(format!("snapshot writer failed: {e}")))?
            .map_err(|e| unavailable(path, e))?;
        tracing::debug!(target: "pipeline", articles = count, "article snapshot written");
        Ok(())
    }
}
