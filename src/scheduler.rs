// src/scheduler.rs
//! # Global Scheduler
//!
//! One coordinating task per process: sleep, then run one fleet-wide cycle
//! under the cross-process lease. A cycle fetches every enabled source once,
//! matches against the deduplicated keyword set of all tenants, and fans each
//! match out to every tenant owning the keyword text.
//!
//! The sleep wakes early on `trigger_now()` and on `stop()`. A cycle that
//! errors or panics still releases its lease with the failure recorded.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::expansion::KeywordExpansion;
use crate::ingest::FetchMode;
use crate::lease::LeaseManager;
use crate::matching::MatchingEngine;
use crate::pipeline::{keyword_owners, Pipeline};
use crate::store::JobStore;
use crate::types::{config_secs, MonitorJob, TenantId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Sources fetched per batch; each batch's payload is dropped before the next.
    pub batch_size: usize,
    /// Run the first cycle right away instead of after one interval.
    pub run_on_start: bool,
    /// A global lease older than this is presumed dead and force-expired.
    pub lease_stale_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            batch_size: 50,
            run_on_start: false,
            lease_stale_secs: 2 * 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lease_stale_after(&self) -> chrono::Duration {
        config_secs(self.lease_stale_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CycleStats {
    pub sources: usize,
    pub sources_failed: usize,
    pub keywords: usize,
    /// Keywords left out because their expansion is missing or failed.
    pub skipped_keywords: usize,
    pub fetched: usize,
    pub matched: usize,
    pub saved: usize,
    pub duplicates: usize,
    pub saved_per_tenant: std::collections::BTreeMap<TenantId, usize>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleStats),
    /// Another process holds the lease. Not an error.
    Skipped { reason: String },
    /// The cycle ran and failed; the lease records the message.
    Failed { error: String },
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub interval_secs: u64,
    pub last_stats: Option<CycleStats>,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub cycles_run: u64,
    pub cycles_skipped: u64,
}

struct Inner {
    state: SchedulerState,
    last_stats: Option<CycleStats>,
    last_error: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    cycles_run: u64,
    cycles_skipped: u64,
    /// Match terms of the last cycle that fetched; `None` before the first.
    matched_terms: Option<BTreeSet<(String, String)>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

pub struct GlobalScheduler {
    pipeline: Arc<Pipeline>,
    jobs: Arc<dyn JobStore>,
    lease: LeaseManager,
    cfg: SchedulerConfig,
    wake: Notify,
    inner: Mutex<Inner>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("cycle panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("cycle panicked: {s}")
    } else {
        "cycle panicked".to_string()
    }
}

impl GlobalScheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        jobs: Arc<dyn JobStore>,
        cfg: SchedulerConfig,
        holder: impl Into<String>,
    ) -> Self {
        let lease = LeaseManager::new(jobs.clone(), holder, cfg.lease_stale_after());
        Self {
            pipeline,
            jobs,
            lease,
            cfg,
            wake: Notify::new(),
            inner: Mutex::new(Inner {
                state: SchedulerState::Stopped,
                last_stats: None,
                last_error: None,
                last_run_at: None,
                next_run_at: None,
                cycles_run: 0,
                cycles_skipped: 0,
                matched_terms: None,
                shutdown: None,
                handle: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    /// Spawn the loop. Returns false when it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        if inner.state == SchedulerState::Running {
            return false;
        }
        let (tx, rx) = watch::channel(false);
        inner.state = SchedulerState::Running;
        inner.shutdown = Some(tx);
        let this = Arc::clone(self);
        inner.handle = Some(tokio::spawn(async move { this.run_loop(rx).await }));
        tracing::info!(
            target: "scheduler",
            holder = %self.lease.holder(),
            interval_secs = self.cfg.interval_secs,
            run_on_start = self.cfg.run_on_start,
            "global scheduler started"
        );
        true
    }

    /// Signal the loop to exit. A cycle already in flight finishes (and
    /// releases its lease) in the background. Returns false when not running.
    pub fn stop(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == SchedulerState::Stopped {
            return false;
        }
        if let Some(tx) = inner.shutdown.take() {
            let _ = tx.send(true);
        }
        inner.state = SchedulerState::Stopped;
        inner.next_run_at = None;
        inner.handle = None;
        tracing::info!(target: "scheduler", "global scheduler stopping");
        true
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(&self) {
        let handle = {
            let mut inner = self.lock();
            if let Some(tx) = inner.shutdown.take() {
                let _ = tx.send(true);
            }
            inner.state = SchedulerState::Stopped;
            inner.next_run_at = None;
            inner.handle.take()
        };
        if let Some(h) = handle {
            if let Err(e) = h.await {
                tracing::warn!(target: "scheduler", error = %e, "scheduler task ended abnormally");
            }
        }
    }

    /// Wake the sleeping loop. When the loop is stopped, run one cycle on a
    /// spawned task instead.
    pub fn trigger_now(self: &Arc<Self>) {
        let running = self.lock().state == SchedulerState::Running;
        if running {
            // A stored permit wakes the next sleep if a cycle is in flight.
            self.wake.notify_one();
            tracing::info!(target: "scheduler", "cycle triggered");
        } else {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_cycle().await;
            });
            tracing::info!(target: "scheduler", "one-off cycle triggered while stopped");
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.lock();
        SchedulerStatus {
            state: inner.state,
            interval_secs: self.cfg.interval_secs,
            last_stats: inner.last_stats.clone(),
            last_error: inner.last_error.clone(),
            last_run_at: inner.last_run_at,
            next_run_at: inner.next_run_at,
            cycles_run: inner.cycles_run,
            cycles_skipped: inner.cycles_skipped,
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut first = true;
        loop {
            if !(first && self.cfg.run_on_start) {
                let interval = self.cfg.interval();
                {
                    let mut inner = self.lock();
                    // stop() may have won the race
                    if inner.state == SchedulerState::Running {
                        inner.next_run_at =
                            chrono::Duration::from_std(interval).ok().map(|d| Utc::now() + d);
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.wake.notified() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            first = false;
            if *shutdown.borrow() {
                break;
            }
            self.warm_expansions().await;
            self.run_cycle().await;
        }
        tracing::info!(target: "scheduler", "global scheduler stopped");
    }

    /// Expand keywords that have no usable expansion yet, waiting at most the
    /// warm-up budget; stale ones refresh in the background. Runs outside the
    /// lease; failures only mean fewer keywords this cycle.
    pub async fn warm_expansions(&self) {
        match self.pipeline.catalog.enabled_keywords().await {
            Ok(keywords) => {
                self.pipeline.expansions.warm_bounded(&keywords).await;
            }
            Err(e) => {
                tracing::warn!(target: "scheduler", error = ?e, "loading keywords for warm-up failed");
            }
        }
    }

    /// Run one cycle now. Skipped when another holder has the lease.
    pub async fn run_cycle(&self) -> CycleOutcome {
        crate::metrics::ensure_metrics_described();
        let t0 = Instant::now();

        let mut lease = match self.lease.acquire().await {
            Ok(Some(lease)) => lease,
            Ok(None) => return self.record(CycleOutcome::Skipped { reason: "lock held".into() }),
            Err(e) => {
                tracing::warn!(target: "scheduler", error = ?e, "lease store unavailable, skipping cycle");
                return self.record(CycleOutcome::Skipped {
                    reason: format!("lease unavailable: {e:#}"),
                });
            }
        };

        let result = AssertUnwindSafe(self.cycle_body(&mut lease)).catch_unwind().await;
        let (released, outcome) = match result {
            Ok(Ok(mut stats)) => {
                stats.duration_ms = t0.elapsed().as_millis() as u64;
                (Ok(()), CycleOutcome::Completed(stats))
            }
            Ok(Err(e)) => {
                let msg = format!("{e:#}");
                (Err(msg.clone()), CycleOutcome::Failed { error: msg })
            }
            Err(payload) => {
                let msg = panic_message(payload);
                (Err(msg.clone()), CycleOutcome::Failed { error: msg })
            }
        };
        if let Err(e) = self.lease.release(&mut lease, released).await {
            tracing::error!(target: "scheduler", lease = %lease.id, error = ?e, "releasing lease failed");
        }

        histogram!("cycle_duration_ms").record(t0.elapsed().as_millis() as f64);
        gauge!("cycle_last_run_ts").set(Utc::now().timestamp() as f64);
        self.pipeline.health.persist();
        self.record(outcome)
    }

    fn record(&self, outcome: CycleOutcome) -> CycleOutcome {
        counter!("cycles_total", "outcome" => outcome.label()).increment(1);
        let mut inner = self.lock();
        match &outcome {
            CycleOutcome::Completed(stats) => {
                inner.cycles_run += 1;
                inner.last_run_at = Some(Utc::now());
                inner.last_stats = Some(stats.clone());
                inner.last_error = None;
                tracing::info!(
                    target: "scheduler",
                    sources = stats.sources,
                    sources_failed = stats.sources_failed,
                    keywords = stats.keywords,
                    fetched = stats.fetched,
                    matched = stats.matched,
                    saved = stats.saved,
                    duplicates = stats.duplicates,
                    duration_ms = stats.duration_ms,
                    "cycle completed"
                );
            }
            CycleOutcome::Skipped { reason } => {
                inner.cycles_skipped += 1;
                tracing::info!(target: "scheduler", %reason, "cycle skipped");
            }
            CycleOutcome::Failed { error } => {
                inner.cycles_run += 1;
                inner.last_run_at = Some(Utc::now());
                inner.last_error = Some(error.clone());
                tracing::error!(target: "scheduler", %error, "cycle failed");
            }
        }
        outcome
    }

    async fn progress(&self, lease: &mut MonitorJob, phase: &str, percent: u8) {
        lease.progress.phase = phase.to_string();
        lease.progress.percent = percent;
        if let Err(e) = self.jobs.update_job(lease).await {
            tracing::warn!(target: "scheduler", lease = %lease.id, error = ?e, "lease progress update failed");
        }
    }

    async fn cycle_body(&self, lease: &mut MonitorJob) -> anyhow::Result<CycleStats> {
        let p = &self.pipeline;
        let mut stats = CycleStats::default();

        self.progress(lease, "keywords", 5).await;
        let keywords = p.catalog.enabled_keywords().await.context("loading enabled keywords")?;
        let owners = keyword_owners(&keywords);
        let expansions = p.load_expansions(owners.keys());
        stats.keywords = expansions.len();
        stats.skipped_keywords = owners.len() - expansions.len();
        if expansions.is_empty() {
            tracing::info!(target: "scheduler", owned = owners.len(), "no usable keywords, nothing to match");
            return Ok(stats);
        }
        let engine = MatchingEngine::new(&expansions);

        self.progress(lease, "fetch", 10).await;
        let sources = p.catalog.enabled_sources().await.context("loading enabled sources")?;
        let terms = match_terms(&expansions);
        let mode = {
            let inner = self.lock();
            match &inner.matched_terms {
                Some(previous) if terms.is_subset(previous) => FetchMode::Conditional,
                _ => FetchMode::Refresh,
            }
        };
        tracing::debug!(target: "scheduler", ?mode, terms = terms.len(), "fetching sources");
        let (matches, fm) = p.fetch_and_match(&sources, &engine, self.cfg.batch_size, mode).await;
        self.lock().matched_terms = Some(terms);
        stats.sources = fm.sources;
        stats.sources_failed = fm.sources_failed;
        stats.fetched = fm.articles_fetched;
        stats.matched = matches.len();
        lease.progress.fetched = stats.fetched;
        lease.progress.matched = stats.matched;

        self.progress(lease, "persist", 70).await;
        let persisted = p.persist_all(matches, &owners).await;
        stats.saved = persisted.saved;
        stats.duplicates = persisted.duplicates;
        stats.saved_per_tenant = persisted.saved_per_tenant;
        lease.progress.saved = stats.saved;
        if persisted.errors > 0 {
            tracing::warn!(target: "scheduler", errors = persisted.errors, "some tenant copies were not saved");
        }
        Ok(stats)
    }
}

/// Every literal the engine searches for. Unchanged feeds only need a full
/// download when this set gains entries.
fn match_terms(expansions: &[KeywordExpansion]) -> BTreeSet<(String, String)> {
    expansions
        .iter()
        .flat_map(|e| e.all_variants())
        .map(|(lang, text)| (lang.to_string(), text.to_string()))
        .collect()
}
