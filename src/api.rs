use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::classify::{Category, Industry};
use crate::config::SourceSeed;
use crate::error::{NotFound, StoreError};
use crate::orchestrator::{CycleReport, Orchestrator, ReclassifySummary};
use crate::sources::{Source, SourceCounts};
use crate::stats::{Stats, SystemStatus};
use crate::store::{ArticlePage, ArticleQuery, CanonicalArticle, ProcessingState, SortKey, SortOrder};

const MAX_TRACKED_JOBS: usize = 64;
const DEFAULT_PROCESS_LIMIT: usize = 20;
const MAX_PROCESS_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    jobs: Arc<RwLock<Jobs>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            jobs: Arc::new(RwLock::new(Jobs::default())),
        }
    }
}

/// Background ingest runs started with `mode = "async"`, newest last.
#[derive(Default)]
struct Jobs {
    order: VecDeque<Uuid>,
    by_id: HashMap<Uuid, JobStatus>,
}

impl Jobs {
    fn start(&mut self, id: Uuid) {
        if self.order.len() == MAX_TRACKED_JOBS {
            if let Some(old) = self.order.pop_front() {
                self.by_id.remove(&old);
            }
        }
        self.order.push_back(id);
        self.by_id.insert(id, JobStatus::Running);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "report", rename_all = "lowercase")]
enum JobStatus {
    Running,
    Done(Box<CycleReport>),
}

pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/articles", get(list_articles))
        .route("/articles/{id}", get(get_article))
        .route("/sources", get(list_sources).post(register_source))
        .route("/sources/{id}", get(get_source).patch(patch_source))
        .route("/stats", get(stats))
        .route("/ingest/run", post(ingest_run))
        .route("/ingest/jobs/{id}", get(ingest_job))
        .route("/gpt/process", post(gpt_process));

    #[cfg(feature = "debug")]
    let router = router.route("/debug/config", get(debug_config));

    router.layer(CorsLayer::very_permissive()).with_state(state)
}

/// Effective pipeline configuration (after file, env overrides and clamping).
#[cfg(feature = "debug")]
async fn debug_config(State(state): State<AppState>) -> Json<crate::config::PipelineConfig> {
    Json(state.orchestrator.config().clone())
}

// ---- errors ----

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(m) => {
                tracing::error!(target: "api", error = %m, "store unavailable");
                ApiError::Unavailable("article store unavailable".into())
            }
            StoreError::ConstraintViolation(m) => ApiError::Conflict(m),
        }
    }
}

impl From<NotFound> for ApiError {
    fn from(e: NotFound) -> Self {
        ApiError::NotFound(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Empty body means "all defaults".
fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

// ---- health & stats ----

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestionOut {
    last_run: Option<DateTime<Utc>>,
    last_source: Option<String>,
    last_items_saved: usize,
}

#[derive(Serialize)]
struct HealthSourcesOut {
    total: usize,
    active: usize,
    healthy: usize,
}

#[derive(Serialize)]
struct HealthOut {
    status: SystemStatus,
    timestamp: DateTime<Utc>,
    ingestion: IngestionOut,
    sources: HealthSourcesOut,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthOut>) {
    let orch = &state.orchestrator;
    let counts: SourceCounts = orch.registry().counts();
    let last = orch.stats().last_cycle();
    let store_ok = orch.store().counts().await.is_ok();
    let status = orch.stats().status(&counts, last.as_ref(), store_ok);

    let ingestion = IngestionOut {
        last_run: last.as_ref().map(|r| r.finished_at),
        last_source: last
            .as_ref()
            .and_then(|r| r.last_source.clone())
            .or_else(|| orch.registry().last_fetched().map(|s| s.name)),
        last_items_saved: last.as_ref().map_or(0, |r| r.items_saved()),
    };
    let code = if status == SystemStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(HealthOut {
            status,
            timestamp: Utc::now(),
            ingestion,
            sources: HealthSourcesOut {
                total: counts.total,
                active: counts.active,
                healthy: counts.healthy,
            },
        }),
    )
}

async fn stats(State(state): State<AppState>) -> Json<Stats> {
    let orch = &state.orchestrator;
    Json(
        orch.stats()
            .snapshot(orch.registry(), orch.store().as_ref())
            .await,
    )
}

// ---- articles ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    limit: Option<usize>,
    page: Option<usize>,
    sort_by: Option<SortKey>,
    sort_order: Option<SortOrder>,
    industry: Option<String>,
    category: Option<String>,
    requires_review: Option<bool>,
    source: Option<String>,
    state: Option<ProcessingState>,
}

impl ListParams {
    fn into_query(self) -> Result<ArticleQuery, ApiError> {
        let industry = self
            .industry
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<Industry>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        let category = self
            .category
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<Category>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        Ok(ArticleQuery {
            limit: self
                .limit
                .unwrap_or(ArticleQuery::DEFAULT_LIMIT)
                .clamp(1, ArticleQuery::MAX_LIMIT),
            page: self.page.unwrap_or(1).max(1),
            sort_by: self.sort_by.unwrap_or_default(),
            sort_order: self.sort_order.unwrap_or_default(),
            industry,
            category,
            requires_review: self.requires_review,
            source: self.source,
            state: self.state,
        })
    }
}

async fn list_articles(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<ArticlePage> {
    let query = params.into_query()?;
    Ok(Json(state.orchestrator.store().list(&query).await?))
}

async fn get_article(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CanonicalArticle> {
    state
        .orchestrator
        .store()
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("article not found: {id}")))
}

// ---- sources ----

async fn list_sources(State(state): State<AppState>) -> Json<Vec<Source>> {
    Json(state.orchestrator.registry().list_all())
}

async fn get_source(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Source> {
    Ok(Json(state.orchestrator.registry().get(&id)?))
}

async fn register_source(
    State(state): State<AppState>,
    Json(seed): Json<SourceSeed>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    if seed.name.trim().is_empty() || seed.rss_feed.trim().is_empty() {
        return Err(ApiError::BadRequest("name and rssFeed are required".into()));
    }
    match state.orchestrator.registry().register(&seed) {
        Some(src) => Ok((StatusCode::CREATED, Json(src))),
        None => Err(ApiError::Conflict(format!(
            "source already exists: {}",
            seed.stable_id()
        ))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchSource {
    is_active: bool,
}

async fn patch_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchSource>,
) -> ApiResult<Source> {
    Ok(Json(
        state
            .orchestrator
            .registry()
            .set_active(&id, body.is_active)?,
    ))
}

// ---- ingestion & classification ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RunMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Default, Deserialize)]
struct RunReq {
    #[serde(default)]
    mode: RunMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobOut {
    job_id: Uuid,
}

async fn ingest_run(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let req: RunReq = parse_body(&body)?;
    match req.mode {
        RunMode::Sync => {
            let report = state.orchestrator.run_cycle().await;
            Ok(Json(report).into_response())
        }
        RunMode::Async => {
            let job_id = Uuid::new_v4();
            state
                .jobs
                .write()
                .expect("jobs lock poisoned")
                .start(job_id);
            let orch = state.orchestrator.clone();
            let jobs = state.jobs.clone();
            tokio::spawn(async move {
                let report = orch.run_cycle().await;
                let mut jobs = jobs.write().expect("jobs lock poisoned");
                if let Some(slot) = jobs.by_id.get_mut(&job_id) {
                    *slot = JobStatus::Done(Box::new(report));
                }
            });
            tracing::info!(target: "api", job = %job_id, "ingest job started");
            Ok((StatusCode::ACCEPTED, Json(JobOut { job_id })).into_response())
        }
    }
}

async fn ingest_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let jobs = state.jobs.read().expect("jobs lock poisoned");
    match jobs.by_id.get(&id) {
        Some(status) => Ok(Json(status.clone()).into_response()),
        None => Err(ApiError::NotFound(format!("job not found: {id}"))),
    }
}

#[derive(Debug, Deserialize)]
struct ProcessReq {
    #[serde(default = "default_process_limit")]
    limit: usize,
}

impl Default for ProcessReq {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PROCESS_LIMIT,
        }
    }
}

fn default_process_limit() -> usize {
    DEFAULT_PROCESS_LIMIT
}

async fn gpt_process(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReclassifySummary>, ApiError> {
    let req: ProcessReq = parse_body(&body)?;
    let summary = state
        .orchestrator
        .reclassify_backlog(req.limit.min(MAX_PROCESS_LIMIT))
        .await;
    if summary.store_unavailable && summary.attempted == 0 {
        return Err(ApiError::Unavailable("article store unavailable".into()));
    }
    Ok(Json(summary))
}
