//! feedwatch — binary entrypoint.
//! Loads config and catalog, wires the shared services, and runs the global
//! scheduler until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feedwatch::config::{load_catalog_default, MonitorConfig};
use feedwatch::expansion::{ExpansionCache, ProperNounTable};
use feedwatch::health::FeedHealthTracker;
use feedwatch::ingest::http::{HttpTransport, DEFAULT_USER_AGENT};
use feedwatch::ingest::FeedFetcher;
use feedwatch::jobs::JobExecutor;
use feedwatch::lease::worker_id;
use feedwatch::pipeline::Pipeline;
use feedwatch::scheduler::GlobalScheduler;
use feedwatch::store::{ArticleStore, CatalogStore, JobStore};
use feedwatch::translate::build_translator;

/// Compact logs by default, JSON lines with `LOG_FORMAT=json`.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedwatch=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    if let Some(addr) = feedwatch::metrics::metrics_addr_from_env() {
        feedwatch::metrics::install_prometheus(addr)?;
        tracing::info!(target: "feedwatch", %addr, "prometheus exporter listening");
    }

    let cfg = MonitorConfig::load().context("loading monitor config")?;
    let catalog = load_catalog_default().context("loading catalog")?;
    tracing::info!(
        target: "feedwatch",
        sources = catalog.sources.len(),
        keywords = catalog.keywords.len(),
        "catalog loaded"
    );
    let store = Arc::new(catalog.into_store());
    let catalog_store: Arc<dyn CatalogStore> = store.clone();
    let article_store: Arc<dyn ArticleStore> = store.clone();
    let job_store: Arc<dyn JobStore> = store.clone();

    let translator = build_translator(&cfg.translator)?;
    let proper_nouns = match &cfg.expansion.proper_nouns_path {
        Some(p) => ProperNounTable::load_from_file(p),
        None => ProperNounTable::default_seed(),
    };
    let expansions = Arc::new(ExpansionCache::new(translator.clone(), &cfg.expansion, proper_nouns));

    let user_agent = if cfg.fetcher.user_agent.trim().is_empty() {
        DEFAULT_USER_AGENT
    } else {
        cfg.fetcher.user_agent.as_str()
    };
    let transport = Arc::new(HttpTransport::new(user_agent)?);
    let fetcher = Arc::new(FeedFetcher::new(transport, cfg.fetcher.clone()));
    let health = Arc::new(FeedHealthTracker::load_or_new(cfg.health.clone()));

    let pipeline = Arc::new(Pipeline {
        fetcher,
        expansions: expansions.clone(),
        health: health.clone(),
        translator,
        catalog: catalog_store.clone(),
        articles: article_store,
        context: cfg.context.clone(),
        display_language: cfg.display_language.clone(),
    });

    let holder = worker_id();
    let executor = Arc::new(JobExecutor::new(
        pipeline.clone(),
        job_store.clone(),
        cfg.jobs.clone(),
        cfg.balancer.clone(),
        holder.clone(),
    ));
    match executor.recover_abandoned().await {
        Ok(n) if n > 0 => tracing::info!(target: "feedwatch", closed = n, "closed abandoned jobs"),
        Ok(_) => {}
        Err(e) => tracing::warn!(target: "feedwatch", error = ?e, "abandoned job recovery failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = (cfg.expansion.refresh_interval_secs > 0).then(|| {
        expansions.clone().spawn_refresher(
            catalog_store.clone(),
            Duration::from_secs(cfg.expansion.refresh_interval_secs),
            shutdown_rx,
        )
    });

    let scheduler = Arc::new(GlobalScheduler::new(pipeline, job_store, cfg.scheduler.clone(), holder));
    if cfg.scheduler.enabled {
        scheduler.start();
    } else {
        tracing::info!(target: "feedwatch", "global scheduler disabled by config");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!(target: "feedwatch", "shutting down");

    let _ = shutdown_tx.send(true);
    scheduler.shutdown().await;
    if let Some(h) = refresher {
        let _ = h.await;
    }
    health.persist();

    let summary = health.summary();
    tracing::info!(
        target: "feedwatch",
        sources = summary.total_sources,
        healthy = summary.healthy,
        unhealthy = summary.unhealthy.len(),
        success_rate = summary.success_rate,
        jobs_in_flight = executor.running(),
        "stopped"
    );
    Ok(())
}
