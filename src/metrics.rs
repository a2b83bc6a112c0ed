use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::config::PipelineConfig;

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

impl Metrics {
    /// Install the process-wide Prometheus recorder (once) and publish the
    /// static pipeline settings as gauges. Later calls reuse the recorder.
    pub fn init(cfg: &PipelineConfig) -> anyhow::Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| PrometheusBuilder::new().install_recorder())?
            .clone();

        gauge!("pipeline_interval_secs").set(cfg.orchestrator.interval_secs as f64);
        gauge!("pipeline_max_in_flight_sources").set(cfg.orchestrator.max_in_flight_sources as f64);
        gauge!("classify_review_threshold").set(cfg.classifier.review_threshold);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
