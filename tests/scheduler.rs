// tests/scheduler.rs
//
// Periodic driver: ticks on the configured interval, never overlaps itself
// and stops (cancelling the running cycle) when the shutdown flag flips.

mod common;

use std::time::Duration;

use common::{harness, rss, Reply};
use newsdesk::ingest::scheduler::{spawn_scheduler, SchedulerCfg};
use tokio::sync::watch;

const ITEMS: [(&str, &str, &str); 1] = [(
    "Volvo unveils compact electric SUV",
    "https://alpha.example.com/volvo-ex30",
    "Priced below rivals.",
)];

#[tokio::test(start_paused = true)]
async fn ticks_on_interval_until_stopped() {
    let h = harness(&["Alpha"]);
    h.fetcher.set("alpha", Reply::ok(rss(&ITEMS)));
    let (stop_tx, stop_rx) = watch::channel(false);

    let task = spawn_scheduler(
        h.orchestrator.clone(),
        SchedulerCfg {
            interval_secs: 60,
            run_on_start: true,
        },
        stop_rx,
    );

    // Ticks at t = 0, 60 and 120.
    tokio::time::sleep(Duration::from_secs(125)).await;
    assert_eq!(h.fetcher.calls(), 3);

    stop_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(h.orchestrator.stats().cycles_run(), 3);

    // Only the first cycle stored anything.
    let last = h.orchestrator.stats().last_cycle().unwrap();
    assert_eq!(last.items_duplicate, 1);
}

#[tokio::test(start_paused = true)]
async fn first_tick_waits_one_interval_when_not_run_on_start() {
    let h = harness(&["Alpha"]);
    h.fetcher.set("alpha", Reply::ok(rss(&ITEMS)));
    let (stop_tx, stop_rx) = watch::channel(false);

    let task = spawn_scheduler(
        h.orchestrator.clone(),
        SchedulerCfg {
            interval_secs: 60,
            run_on_start: false,
        },
        stop_rx,
    );
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.fetcher.calls(), 0);
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(h.fetcher.calls(), 1);

    stop_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_the_running_cycle() {
    let h = harness(&["Alpha"]);
    h.fetcher
        .set("alpha", Reply::slow(rss(&ITEMS), Duration::from_secs(600)));
    let (stop_tx, stop_rx) = watch::channel(false);

    let task = spawn_scheduler(
        h.orchestrator.clone(),
        SchedulerCfg {
            interval_secs: 3600,
            run_on_start: true,
        },
        stop_rx,
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    let report = h.orchestrator.stats().last_cycle().unwrap();
    assert!(report.cancelled);
    assert_eq!(h.registry.get("alpha").unwrap().error_count, 1);
}
