// tests/metrics.rs
mod common;

use std::sync::Arc;

use common::*;
use feedwatch::metrics::ensure_metrics_described;
use feedwatch::scheduler::{CycleOutcome, GlobalScheduler, SchedulerConfig};
use feedwatch::store::MemoryStore;
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::test]
async fn cycle_series_show_up_in_exposition() {
    // Only test in this binary, so the global recorder is ours.
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install recorder");
    ensure_metrics_described();

    let store = MemoryStore::with_catalog(fixture_sources(), vec![keyword(1, 1, "مصر")]);
    let h = harness(store, fixture_transport());
    let s = Arc::new(GlobalScheduler::new(
        h.pipeline.clone(),
        h.store.clone(),
        SchedulerConfig::default(),
        "w:1",
    ));
    s.warm_expansions().await;
    assert!(matches!(s.run_cycle().await, CycleOutcome::Completed(_)));

    let body = handle.render();
    for name in [
        "feed_fetch_total",
        "match_total",
        "articles_saved_total",
        "cycles_total",
        "cycle_duration_ms",
    ] {
        assert!(body.contains(name), "missing {name} in:\n{body}");
    }
    assert!(body.contains("# HELP cycles_total"));
}

#[serial_test::serial]
#[test]
fn metrics_addr_parses_from_env() {
    std::env::set_var("METRICS_ADDR", "127.0.0.1:9464");
    assert_eq!(
        feedwatch::metrics::metrics_addr_from_env().map(|a| a.port()),
        Some(9464)
    );
    std::env::set_var("METRICS_ADDR", "not-an-addr");
    assert!(feedwatch::metrics::metrics_addr_from_env().is_none());
    std::env::remove_var("METRICS_ADDR");
    assert!(feedwatch::metrics::metrics_addr_from_env().is_none());
}
