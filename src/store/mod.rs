// src/store/mod.rs
pub mod article;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::classify::{Category, Industry};
use crate::error::StoreError;

pub use article::{ArticleUpdate, CanonicalArticle, ProcessingState};
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// Another article already owns the canonical link.
    Exists(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    PublishedAt,
    IngestedAt,
    Importance,
    Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArticleQuery {
    pub limit: usize,
    /// 1-based.
    pub page: usize,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
    pub industry: Option<Industry>,
    pub category: Option<Category>,
    pub requires_review: Option<bool>,
    pub source: Option<String>,
    /// `None` lists everything except duplicates.
    pub state: Option<ProcessingState>,
}

impl ArticleQuery {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 200;
}

impl Default for ArticleQuery {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            page: 1,
            sort_by: SortKey::default(),
            sort_order: SortOrder::default(),
            industry: None,
            category: None,
            requires_review: None,
            source: None,
            state: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticlePage {
    pub items: Vec<CanonicalArticle>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleCounts {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_industry: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub requires_review: usize,
}

/// Sole writer of canonical articles.
///
/// `insert_if_absent` is the only cross-pipeline synchronization point: the
/// check and the insert on the canonical link happen as one step.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn insert_if_absent(&self, article: CanonicalArticle)
        -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<CanonicalArticle>, StoreError>;

    async fn find_by_link(&self, canonical_link: &str)
        -> Result<Option<CanonicalArticle>, StoreError>;

    /// Non-duplicate articles of one source published within `[from, to]`.
    async fn recent_from_source(
        &self,
        source_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalArticle>, StoreError>;

    /// Apply an update; an invalid state transition is a `ConstraintViolation`.
    async fn apply(&self, id: Uuid, update: ArticleUpdate)
        -> Result<CanonicalArticle, StoreError>;

    async fn list(&self, query: &ArticleQuery) -> Result<ArticlePage, StoreError>;

    /// Pending articles and failed ones below the attempt bound, oldest first.
    async fn reclassify_candidates(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<CanonicalArticle>, StoreError>;

    async fn counts(&self) -> Result<ArticleCounts, StoreError>;

    /// Persist pending writes, if the backend buffers any.
    async fn flush(&self) -> Result<(), StoreError>;
}
