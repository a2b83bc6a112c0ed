// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health (healthy and store-down)
// - POST /ingest/run (sync and async) and GET /ingest/jobs/{id}
// - GET /articles filters and label validation
// - GET/POST/PATCH /sources
// - GET /stats, POST /gpt/process

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use common::{harness, harness_with, rss, static_classifier, Harness, Reply};
use newsdesk::config::PipelineConfig;
use newsdesk::{router, AppState};

const BODY_LIMIT: usize = 1024 * 1024;

fn app(h: &Harness) -> Router {
    router(AppState::new(h.orchestrator.clone()))
}

fn fed_harness() -> Harness {
    let h = harness(&["Alpha", "Beta"]);
    h.fetcher.set(
        "alpha",
        Reply::ok(rss(&[
            ("Toyota launches hydrogen pickup", "https://alpha.example.com/1", "First look."),
            ("Nissan quarterly profit slides", "https://alpha.example.com/2", "Margins shrink."),
        ])),
    );
    h.fetcher.set(
        "beta",
        Reply::ok(rss(&[(
            "Hyundai opens Georgia battery plant",
            "https://beta.example.com/1",
            "Production begins.",
        )])),
    );
    h
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, Json) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app
        .clone()
        .oneshot(req.body(body).expect("build request"))
        .await
        .expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        Json::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_sources_and_last_run() {
    let h = fed_harness();
    let app = app(&h);

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sources"]["total"], 2);
    assert_eq!(body["sources"]["active"], 2);
    assert!(body["ingestion"]["lastRun"].is_null());

    send(&app, "POST", "/ingest/run", None).await;

    let (_, body) = send(&app, "GET", "/health", None).await;
    assert!(body["ingestion"]["lastRun"].is_string());
    assert_eq!(body["ingestion"]["lastItemsSaved"], 3);
}

#[tokio::test]
async fn health_is_503_when_store_is_down() {
    let h = harness_with(
        PipelineConfig::default(),
        &["Alpha"],
        static_classifier(0.75),
        Arc::new(common::DownStore),
    );
    let (status, body) = send(&app(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn sync_run_returns_the_cycle_report() {
    let h = fed_harness();
    let app = app(&h);

    let (status, report) = send(&app, "POST", "/ingest/run", Some(json!({"mode": "sync"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["sourcesAttempted"], 2);
    assert_eq!(report["itemsStored"], 3);
    assert_eq!(report["sources"].as_array().unwrap().len(), 2);

    let (status, page) = send(&app, "GET", "/articles?industry=automotive&limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["totalPages"], 2);

    let first = &page["items"][0];
    let id = first["id"].as_str().unwrap();
    let (status, one) = send(&app, "GET", &format!("/articles/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["canonicalLink"], first["canonicalLink"]);

    let (status, page) = send(&app, "GET", "/articles?source=beta&requiresReview=false", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
}

#[tokio::test]
async fn unknown_labels_are_rejected() {
    let h = fed_harness();
    let (status, body) = send(&app(&h), "GET", "/articles?industry=Spaceships", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = send(&app(&h), "POST", "/ingest/run", Some(json!({"mode": "later"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn async_run_returns_a_job_handle() {
    let h = fed_harness();
    let app = app(&h);

    let (status, body) = send(&app, "POST", "/ingest/run", Some(json!({"mode": "async"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job = body["jobId"].as_str().unwrap().to_string();

    let mut done = Json::Null;
    for _ in 0..100 {
        let (status, body) = send(&app, "GET", &format!("/ingest/jobs/{job}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] == "done" {
            done = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(done["report"]["itemsStored"], 3);

    let (status, _) = send(
        &app,
        "GET",
        "/ingest/jobs/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sources_can_be_registered_and_toggled() {
    let h = fed_harness();
    let app = app(&h);

    let seed = json!({
        "name": "Green Car Reports",
        "rssFeed": "https://www.greencarreports.com/rss/news",
        "credibility": "High",
        "automotiveFocus": 9
    });
    let (status, created) = send(&app, "POST", "/sources", Some(seed.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "green-car-reports");
    assert_eq!(created["credibility"], 8.0);

    let (status, _) = send(&app, "POST", "/sources", Some(seed)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, list) = send(&app, "GET", "/sources", None).await;
    assert_eq!(list.as_array().unwrap().len(), 3);

    let (status, patched) = send(
        &app,
        "PATCH",
        "/sources/alpha",
        Some(json!({"isActive": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["isActive"], false);
    assert_eq!(patched["isHealthy"], false);

    let (status, _) = send(&app, "PATCH", "/sources/nope", Some(json!({"isActive": true}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_and_backlog_processing() {
    let h = fed_harness();
    let app = app(&h);
    send(&app, "POST", "/ingest/run", None).await;

    let (status, stats) = send(&app, "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["articleCounts"]["total"], 3);
    assert_eq!(stats["cyclesRun"], 1);
    assert_eq!(stats["lastCycleReport"]["itemsStored"], 3);

    // Everything is processed already, so there is nothing to do.
    let (status, summary) = send(&app, "POST", "/gpt/process", Some(json!({"limit": 5}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["attempted"], 0);
    assert_eq!(summary["processed"], 0);
}
