// src/health.rs
//! # Feed Health Tracker
//!
//! Rolling per-source counters fed by fetch outcomes. A source becomes
//! unhealthy after a run of empty or failed fetches. Nothing in here returns an
//! error to the fetch/match pipeline: lock poisoning is recovered, persistence
//! problems are logged.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};

use crate::ingest::types::{FetchOutcome, FetchStatus};
use crate::store::CatalogStore;
use crate::types::SourceId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub empty_threshold: u32,
    pub failure_threshold: u32,
    pub max_tracked: usize,
    /// JSON state file; `None` keeps health in memory only.
    pub state_path: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            empty_threshold: 5,
            failure_threshold: 5,
            max_tracked: 2_000,
            state_path: Some("state/feed_health.json".into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedHealthRecord {
    pub source_name: String,
    pub url: String,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub empty_runs: u64,
    pub consecutive_empty: u32,
    pub consecutive_failures: u32,
    pub total_articles: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl FeedHealthRecord {
    pub fn total_runs(&self) -> u64 {
        self.successful_runs + self.failed_runs + self.empty_runs
    }

    fn apply(&mut self, o: &FetchOutcome, now: DateTime<Utc>) {
        self.source_name = o.source_name.clone();
        self.url = o.url.clone();
        self.last_seen = Some(now);
        match o.status {
            FetchStatus::Success => {
                self.successful_runs += 1;
                self.consecutive_empty = 0;
                self.consecutive_failures = 0;
                self.total_articles += o.article_count as u64;
                self.last_success = Some(now);
            }
            // Unchanged since last fetch: reachable, nothing new.
            FetchStatus::Cached => {
                self.successful_runs += 1;
                self.consecutive_failures = 0;
                self.last_success = Some(now);
            }
            FetchStatus::Empty => {
                self.empty_runs += 1;
                self.consecutive_empty += 1;
                self.consecutive_failures = 0;
            }
            FetchStatus::Timeout | FetchStatus::Error => {
                self.failed_runs += 1;
                self.consecutive_failures += 1;
                self.last_failure = Some(now);
                self.last_error = o.error.clone();
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnhealthySource {
    pub source_id: SourceId,
    pub source_name: String,
    pub url: String,
    pub consecutive_empty: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub total_sources: usize,
    pub healthy: usize,
    pub unhealthy: Vec<UnhealthySource>,
    /// Successful runs over all runs, `0.0` with no data.
    pub success_rate: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HealthState {
    records: HashMap<SourceId, FeedHealthRecord>,
}

pub struct FeedHealthTracker {
    cfg: HealthConfig,
    inner: Mutex<HealthState>,
}

impl FeedHealthTracker {
    pub fn new(cfg: HealthConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(HealthState::default()),
        }
    }

    /// Tracker seeded from `cfg.state_path` when it exists and parses.
    pub fn load_or_new(cfg: HealthConfig) -> Self {
        let tracker = Self::new(cfg);
        if let Some(path) = tracker.state_path() {
            if path.exists() {
                match tracker.load_from(&path) {
                    Ok(n) => tracing::info!(target: "health", path = %path.display(), sources = n, "feed health restored"),
                    Err(e) => tracing::warn!(target: "health", error = ?e, "feed health state unreadable, starting empty"),
                }
            }
        }
        tracker
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.cfg
            .state_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(target: "health", "health state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Fold one batch of outcomes into the counters.
    pub fn record_batch(&self, outcomes: &[FetchOutcome]) {
        let now = Utc::now();
        let mut state = self.lock();
        for o in outcomes {
            state.records.entry(o.source_id).or_default().apply(o, now);
        }
        let max = self.cfg.max_tracked.max(1);
        while state.records.len() > max {
            let victim = state
                .records
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.last_seen
                        .cmp(&b.last_seen)
                        .then(a.total_runs().cmp(&b.total_runs()))
                })
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    state.records.remove(&id);
                }
                None => break,
            }
        }
        gauge!("feed_health_tracked").set(state.records.len() as f64);
    }

    pub fn record(&self, source_id: SourceId) -> Option<FeedHealthRecord> {
        self.lock().records.get(&source_id).cloned()
    }

    pub fn is_unhealthy(&self, r: &FeedHealthRecord) -> bool {
        r.consecutive_empty >= self.cfg.empty_threshold.max(1)
            || r.consecutive_failures >= self.cfg.failure_threshold.max(1)
    }

    pub fn summary(&self) -> HealthSummary {
        let state = self.lock();
        let mut unhealthy: Vec<UnhealthySource> = state
            .records
            .iter()
            .filter(|(_, r)| self.is_unhealthy(r))
            .map(|(id, r)| UnhealthySource {
                source_id: *id,
                source_name: r.source_name.clone(),
                url: r.url.clone(),
                consecutive_empty: r.consecutive_empty,
                consecutive_failures: r.consecutive_failures,
                last_error: r.last_error.clone(),
            })
            .collect();
        unhealthy.sort_by_key(|u| u.source_id);

        let (ok, runs) = state
            .records
            .values()
            .fold((0u64, 0u64), |(ok, runs), r| (ok + r.successful_runs, runs + r.total_runs()));

        let total = state.records.len();
        HealthSummary {
            total_sources: total,
            healthy: total - unhealthy.len(),
            unhealthy,
            success_rate: if runs == 0 { 0.0 } else { ok as f64 / runs as f64 },
        }
    }

    /// Push consecutive-failure counters of the given sources back to the
    /// catalog. Best effort.
    pub async fn write_back_failures(&self, catalog: &dyn CatalogStore, outcomes: &[FetchOutcome]) {
        let updates: Vec<(SourceId, u32)> = {
            let state = self.lock();
            outcomes
                .iter()
                .filter_map(|o| state.records.get(&o.source_id).map(|r| (o.source_id, r.consecutive_failures)))
                .collect()
        };
        if updates.is_empty() {
            return;
        }
        if let Err(e) = catalog.record_source_failures(&updates).await {
            tracing::warn!(target: "health", error = ?e, "writing source failure counters failed");
        }
    }

    /// Replace in-memory state with the file's content. Returns the number of
    /// sources loaded.
    pub fn load_from(&self, path: &Path) -> anyhow::Result<usize> {
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let loaded: HealthState =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let n = loaded.records.len();
        *self.lock() = loaded;
        Ok(n)
    }

    /// Write state as JSON via a temp file + rename.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let json = {
            let state = self.lock();
            serde_json::to_vec_pretty(&*state)?
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// `save_to(state_path)`, logging instead of failing.
    pub fn persist(&self) {
        let Some(path) = self.state_path() else {
            return;
        };
        if let Err(e) = self.save_to(&path) {
            tracing::warn!(target: "health", error = ?e, path = %path.display(), "saving feed health failed");
        }
    }
}
