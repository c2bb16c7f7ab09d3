// src/metrics.rs
use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_fetch_total", "Feed fetches by final status.");
        describe_counter!("feed_fetch_errors_total", "Feed fetches that ended in timeout or error.");
        describe_histogram!("feed_fetch_ms", "Wall time per feed fetch including retries, in milliseconds.");
        describe_counter!("expansion_refresh_total", "Keyword expansion refreshes by resulting status.");
        describe_counter!(
            "expansion_warm_timeouts_total",
            "Warm-ups that returned before new keywords finished expanding."
        );
        describe_counter!("match_total", "Articles that matched at least one keyword.");
        describe_counter!("articles_saved_total", "Tenant-scoped article rows inserted.");
        describe_counter!("articles_duplicate_total", "Tenant-scoped inserts skipped as duplicates.");
        describe_counter!("cycles_total", "Global cycles by outcome.");
        describe_histogram!("cycle_duration_ms", "Global cycle wall time in milliseconds.");
        describe_gauge!("cycle_last_run_ts", "Unix ts when the last global cycle finished.");
        describe_counter!("lease_force_expired_total", "Stale global leases force-expired.");
        describe_counter!("jobs_started_total", "Tenant jobs accepted.");
        describe_counter!("jobs_rejected_total", "Tenant jobs rejected by rate limit or capacity.");
        describe_counter!("jobs_finished_total", "Tenant jobs by terminal status.");
        describe_gauge!("jobs_running", "Tenant jobs currently executing in this process.");
        describe_gauge!("feed_health_tracked", "Sources tracked by the feed health tracker.");
    });
}

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("prometheus: install exporter: {e}"))?;
    ensure_metrics_described();
    Ok(())
}

/// `METRICS_ADDR` (e.g. `0.0.0.0:9000`) when set and valid.
pub fn metrics_addr_from_env() -> Option<SocketAddr> {
    let raw = std::env::var("METRICS_ADDR").ok()?;
    match raw.trim().parse() {
        Ok(addr) => Some(addr),
        Err(e) => {
            tracing::warn!(target: "metrics", value = %raw, error = %e, "ignoring invalid METRICS_ADDR");
            None
        }
    }
}
