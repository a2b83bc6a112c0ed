// src/ingest/scheduler.rs
use metrics::gauge;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::orchestrator::Orchestrator;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval_secs: u64,
    /// Run a cycle right away instead of waiting one interval.
    pub run_on_start: bool,
}

/// Resolves once `rx` flips to `true` or its sender is gone.
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped: nobody can ask us to stop any more.
            std::future::pending::<()>().await;
        }
    }
}

/// Spawn the periodic cycle driver.
///
/// Cycles run inline in the loop, so a slow cycle delays the next tick
/// instead of overlapping it; missed ticks are skipped. Flipping `shutdown`
/// to `true` cancels the running cycle and ends the task.
pub fn spawn_scheduler(
    orchestrator: Orchestrator,
    cfg: SchedulerCfg,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    super::ensure_metrics_described();
    tokio::spawn(async move {
        let period = Duration::from_secs(cfg.interval_secs.max(1));
        let start = if cfg.run_on_start {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stop = wait_for_shutdown(shutdown.clone());
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }
            gauge!("ingest_scheduler_last_tick_ts").set(chrono::Utc::now().timestamp() as f64);

            let report = orchestrator
                .run_cycle_until(wait_for_shutdown(shutdown.clone()))
                .await;
            tracing::info!(
                target: "ingest",
                cycle = %report.id,
                stored = report.items_stored,
                failed_sources = report.sources_failed,
                "scheduled cycle done"
            );
            if report.cancelled {
                break;
            }
        }
        tracing::info!(target: "ingest", "scheduler stopped");
    })
}
