//! Newsdesk: binary entrypoint.
//! Loads configuration and sources, wires the ingestion pipeline, starts the
//! periodic scheduler and serves the REST surface through Shuttle.

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use newsdesk::config::{load_sources_default, PipelineConfig};
use newsdesk::ingest::scheduler::{spawn_scheduler, SchedulerCfg};
use newsdesk::metrics::Metrics;
use newsdesk::{build_orchestrator, router, AppState};

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR SHUTTLE_ENV in {local, development, dev})
///   - NEWSDESK_DEV_LOG=1
fn enable_dev_tracing() {
    let dev_flag = std::env::var("NEWSDESK_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("SHUTTLE_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsdesk=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    enable_dev_tracing();

    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    let seeds = load_sources_default().context("loading source list")?;
    let scheduler_cfg = SchedulerCfg {
        interval_secs: cfg.orchestrator.interval_secs,
        run_on_start: true,
    };
    let metrics = Metrics::init(&cfg).context("installing metrics recorder")?;

    let orchestrator = build_orchestrator(cfg, &seeds)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_scheduler(orchestrator.clone(), scheduler_cfg, stop_rx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "pipeline", "shutdown requested");
            let _ = stop_tx.send(true);
        }
    });

    let app = router(AppState::new(orchestrator)).merge(metrics.router());
    Ok(app.into())
}
