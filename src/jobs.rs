// src/jobs.rs
//! # Tenant Jobs
//!
//! On-demand, single-tenant runs of the monitoring pipeline:
//! `expand → fetch → match → balance → persist`.
//!
//! - At most one non-terminal job per tenant; `start` returns the existing one.
//! - Rolling-window rate limit per tenant and a process-wide concurrency cap.
//! - Cancellation is cooperative and checked between phases (and between
//!   fetch batches), never in the middle of a single source.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::balancer::{balance, BalanceConfig};
use crate::ingest::FetchMode;
use crate::lease::MAX_ERROR_CHARS;
use crate::matching::MatchingEngine;
use crate::pipeline::{keyword_owners, CancelFlag, Pipeline};
use crate::store::JobStore;
use crate::types::{config_secs, truncate_message, JobStatus, MonitorJob, TenantId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Jobs executing at once in this process.
    pub max_concurrent: usize,
    /// Jobs a tenant may start per window; 0 disables the limit.
    pub rate_limit_max: usize,
    pub rate_limit_window_secs: u64,
    /// A non-terminal job no worker tracks is abandoned after this long.
    pub stale_job_secs: u64,
    /// Upper bound for `list`.
    pub history_limit: usize,
    /// Sources fetched per batch inside a job.
    pub batch_size: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            rate_limit_max: 5,
            rate_limit_window_secs: 3600,
            stale_job_secs: 2 * 3600,
            history_limit: 50,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("too many jobs started recently, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("job capacity reached ({max} running)")]
    CapacityExceeded { max: usize },
    #[error("job not found")]
    NotFound,
    #[error("job already {0}")]
    AlreadyTerminal(JobStatus),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// True when an already active job was returned instead of a new one.
    pub existing: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

fn status_label(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

enum RunEnd {
    Done,
    Cancelled,
}

pub struct JobExecutor {
    pipeline: Arc<Pipeline>,
    jobs: Arc<dyn JobStore>,
    cfg: JobsConfig,
    balance: BalanceConfig,
    holder: String,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<Uuid, CancelFlag>>,
    // Serializes the check-then-insert in `start`.
    start_gate: tokio::sync::Mutex<()>,
}

impl JobExecutor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        jobs: Arc<dyn JobStore>,
        cfg: JobsConfig,
        balance: BalanceConfig,
        holder: impl Into<String>,
    ) -> Self {
        let max = cfg.max_concurrent.max(1);
        Self {
            pipeline,
            jobs,
            cfg,
            balance,
            holder: holder.into(),
            permits: Arc::new(Semaphore::new(max)),
            active: Mutex::new(HashMap::new()),
            start_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, CancelFlag>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Jobs tracked (queued or running) by this process.
    pub fn running(&self) -> usize {
        self.active().len()
    }

    fn stale_after(&self) -> chrono::Duration {
        config_secs(self.cfg.stale_job_secs)
    }

    /// Start a job for `tenant`, or return the one already active.
    pub async fn start(self: &Arc<Self>, tenant: TenantId) -> Result<StartResponse, JobError> {
        crate::metrics::ensure_metrics_described();
        let _gate = self.start_gate.lock().await;
        let now = Utc::now();

        if let Some(mut existing) = self.jobs.active_job_for_tenant(tenant).await? {
            let tracked = self.active().contains_key(&existing.id);
            if tracked || now - existing.created_at <= self.stale_after() {
                tracing::debug!(target: "jobs", tenant, job = %existing.id, "returning active job");
                return Ok(StartResponse {
                    job_id: existing.id,
                    status: existing.status,
                    existing: true,
                });
            }
            existing.finish(JobStatus::Failed, Some("abandoned".into()), now);
            self.jobs.update_job(&existing).await?;
            tracing::warn!(target: "jobs", tenant, job = %existing.id, "abandoned job closed");
        }

        if self.cfg.rate_limit_max > 0 {
            let window = config_secs(self.cfg.rate_limit_window_secs.max(1));
            let times = self.jobs.job_times_since(tenant, now - window).await?;
            if times.len() >= self.cfg.rate_limit_max {
                // The window reopens when the oldest counted job ages out.
                let idx = times.len() - self.cfg.rate_limit_max;
                let retry_after_secs = (times[idx] + window - now).num_seconds().max(1) as u64;
                counter!("jobs_rejected_total", "reason" => "rate_limit").increment(1);
                tracing::info!(target: "jobs", tenant, retry_after_secs, "job rejected by rate limit");
                return Err(JobError::RateLimited { retry_after_secs });
            }
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                counter!("jobs_rejected_total", "reason" => "capacity").increment(1);
                tracing::info!(target: "jobs", tenant, max = self.cfg.max_concurrent, "job rejected at capacity");
                return Err(JobError::CapacityExceeded {
                    max: self.cfg.max_concurrent.max(1),
                });
            }
        };

        let job = MonitorJob::queued(tenant, &self.holder, now);
        self.jobs.insert_job(&job).await?;
        let cancel = CancelFlag::new();
        self.active().insert(job.id, cancel.clone());
        counter!("jobs_started_total").increment(1);
        tracing::info!(target: "jobs", tenant, job = %job.id, "job queued");

        let resp = StartResponse {
            job_id: job.id,
            status: job.status,
            existing: false,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.execute(job, cancel, permit).await });
        Ok(resp)
    }

    /// Snapshot of a job owned by `tenant`.
    pub async fn status(&self, job_id: Uuid, tenant: TenantId) -> Result<MonitorJob, JobError> {
        self.jobs
            .get_job(job_id)
            .await?
            .filter(|j| j.tenant_id == tenant)
            .ok_or(JobError::NotFound)
    }

    pub async fn cancel(&self, job_id: Uuid, tenant: TenantId) -> Result<CancelResponse, JobError> {
        let mut job = self.status(job_id, tenant).await?;
        if job.status.is_terminal() {
            return Err(JobError::AlreadyTerminal(job.status));
        }

        let flag = self.active().get(&job_id).cloned();
        if let Some(flag) = flag {
            flag.cancel();
            tracing::info!(target: "jobs", tenant, job = %job_id, "cancellation requested");
            return Ok(CancelResponse {
                success: true,
                message: "cancellation requested".into(),
            });
        }

        match job.status {
            JobStatus::Queued => {
                job.finish(JobStatus::Cancelled, None, Utc::now());
                job.progress.phase = "cancelled".into();
                self.jobs.update_job(&job).await?;
                tracing::info!(target: "jobs", tenant, job = %job_id, "untracked queued job cancelled");
                Ok(CancelResponse {
                    success: true,
                    message: "cancelled".into(),
                })
            }
            _ => Ok(CancelResponse {
                success: false,
                message: format!("job is running on {}", job.holder),
            }),
        }
    }

    /// Most recent jobs of `tenant`, newest first.
    pub async fn list(&self, tenant: TenantId, limit: usize) -> Result<Vec<MonitorJob>, JobError> {
        let limit = limit.clamp(1, self.cfg.history_limit.max(1));
        Ok(self.jobs.list_jobs(tenant, limit).await?)
    }

    /// Drop every persisted article of `tenant`.
    pub async fn reset_tenant(&self, tenant: TenantId) -> Result<usize, JobError> {
        let n = self
            .pipeline
            .articles
            .delete_for_tenant(tenant)
            .await
            .context("deleting tenant articles")?;
        tracing::info!(target: "jobs", tenant, deleted = n, "tenant articles reset");
        Ok(n)
    }

    /// Close non-terminal tenant jobs left behind by dead workers.
    pub async fn recover_abandoned(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut closed = 0;
        for mut job in self.jobs.non_terminal_jobs().await? {
            if job.is_global() || self.active().contains_key(&job.id) {
                continue;
            }
            let since = job.started_at.unwrap_or(job.created_at);
            if now - since <= self.stale_after() {
                continue;
            }
            job.finish(JobStatus::Failed, Some("abandoned".into()), now);
            self.jobs.update_job(&job).await?;
            closed += 1;
        }
        if closed > 0 {
            tracing::warn!(target: "jobs", closed, "abandoned jobs closed");
        }
        Ok(closed)
    }

    async fn save(&self, job: &MonitorJob) {
        if let Err(e) = self.jobs.update_job(job).await {
            tracing::warn!(target: "jobs", job = %job.id, error = ?e, "job update failed");
        }
    }

    async fn progress(&self, job: &mut MonitorJob, phase: &str, percent: u8) {
        job.progress.phase = phase.to_string();
        job.progress.percent = percent.min(100);
        self.save(job).await;
    }

    async fn execute(self: Arc<Self>, mut job: MonitorJob, cancel: CancelFlag, _permit: OwnedSemaphorePermit) {
        gauge!("jobs_running").increment(1.0);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.save(&job).await;

        let result = AssertUnwindSafe(self.run_phases(&mut job, &cancel))
            .catch_unwind()
            .await;
        let now = Utc::now();
        match result {
            Ok(Ok(RunEnd::Done)) => job.finish(JobStatus::Succeeded, None, now),
            Ok(Ok(RunEnd::Cancelled)) => {
                job.finish(JobStatus::Cancelled, None, now);
                job.progress.phase = "cancelled".into();
            }
            Ok(Err(e)) => {
                let msg = truncate_message(&format!("{e:#}"), MAX_ERROR_CHARS);
                job.finish(JobStatus::Failed, Some(msg), now);
            }
            Err(_) => job.finish(JobStatus::Failed, Some("job panicked".into()), now),
        }
        self.save(&job).await;
        self.active().remove(&job.id);
        gauge!("jobs_running").decrement(1.0);
        counter!("jobs_finished_total", "status" => status_label(job.status)).increment(1);
        tracing::info!(
            target: "jobs",
            tenant = job.tenant_id,
            job = %job.id,
            status = %job.status,
            fetched = job.progress.fetched,
            matched = job.progress.matched,
            saved = job.progress.saved,
            error = job.error.as_deref().unwrap_or(""),
            "job finished"
        );
    }

    async fn run_phases(&self, job: &mut MonitorJob, cancel: &CancelFlag) -> anyhow::Result<RunEnd> {
        let p = &self.pipeline;
        let tenant = job.tenant_id;
        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        self.progress(job, "expand", 5).await;
        let keywords = p
            .catalog
            .tenant_keywords(tenant)
            .await
            .context("loading tenant keywords")?;
        let owners = keyword_owners(&keywords);
        p.expansions.warm_bounded(&keywords).await;
        let expansions = p.load_expansions(owners.keys());
        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }
        if expansions.is_empty() {
            tracing::info!(target: "jobs", tenant, job = %job.id, "no usable keywords");
            return Ok(RunEnd::Done);
        }

        self.progress(job, "fetch", 15).await;
        let sources = p
            .catalog
            .tenant_sources(tenant)
            .await
            .context("loading tenant sources")?;
        let chunks: Vec<_> = sources.chunks(self.cfg.batch_size.max(1)).collect();
        let total = chunks.len().max(1);
        let mut articles = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let batch = p.fetch(chunk, FetchMode::Full).await;
            articles.extend(batch.articles);
            job.progress.fetched = articles.len();
            let pct = 15 + (45 * (i + 1) / total) as u8;
            self.progress(job, "fetch", pct).await;
            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
        }

        self.progress(job, "match", 65).await;
        let engine = MatchingEngine::new(&expansions);
        let matches = engine.match_articles(articles);
        job.progress.matched = matches.len();
        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        self.progress(job, "balance", 75).await;
        let selected = balance(matches, &self.balance);
        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        self.progress(job, "persist", 85).await;
        let stats = p.persist_all(selected, &owners).await;
        job.progress.saved = stats.saved;
        if stats.errors > 0 {
            anyhow::bail!("{} article(s) could not be saved", stats.errors);
        }
        Ok(RunEnd::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_read_well() {
        assert_eq!(
            JobError::RateLimited { retry_after_secs: 30 }.to_string(),
            "too many jobs started recently, retry in 30s"
        );
        assert_eq!(JobError::AlreadyTerminal(JobStatus::Succeeded).to_string(), "job already SUCCEEDED");
        assert_eq!(JobError::CapacityExceeded { max: 4 }.to_string(), "job capacity reached (4 running)");
    }

    #[test]
    fn labels_cover_every_status() {
        assert_eq!(status_label(JobStatus::Cancelled), "cancelled");
        assert_eq!(status_label(JobStatus::Succeeded), "succeeded");
    }
}
