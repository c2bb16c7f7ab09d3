// src/lease.rs
//! Cross-process lease for the global cycle.
//!
//! The lease is the RUNNING job owned by `GLOBAL_TENANT`. A process that wants
//! to run a cycle inserts its own RUNNING global job, but only if no other one
//! exists or the existing one is older than the staleness threshold (holder
//! presumed dead). The check-and-insert is one atomic store operation
//! (`JobStore::try_acquire_lease`); the decision itself lives here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use uuid::Uuid;

use crate::store::JobStore;
use crate::types::{truncate_message, JobStatus, MonitorJob, GLOBAL_TENANT};

pub const MAX_ERROR_CHARS: usize = 500;

/// A lease started at `started_at` is stale once it is older than `threshold`.
pub fn is_stale(started_at: DateTime<Utc>, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    now - started_at > threshold
}

/// `host:pid` of this process, recorded as the holder of jobs and leases.
pub fn worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host.trim(), std::process::id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No live lease: take it.
    Acquire,
    /// Somebody else holds a live lease.
    Held,
    /// Existing lease is stale: expire it, then take it.
    ForceExpire,
}

/// What to do given the current RUNNING global job, if any.
pub fn evaluate(existing: Option<&MonitorJob>, now: DateTime<Utc>, threshold: chrono::Duration) -> LeaseDecision {
    match existing {
        None => LeaseDecision::Acquire,
        Some(job) => {
            let started = job.started_at.unwrap_or(job.created_at);
            if is_stale(started, now, threshold) {
                LeaseDecision::ForceExpire
            } else {
                LeaseDecision::Held
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseAttempt {
    /// `expired` is the id of a stale lease that was force-expired on the way.
    Acquired { expired: Option<Uuid> },
    Held { holder: String, since: DateTime<Utc> },
}

pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    holder: String,
    stale_after: chrono::Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn JobStore>, holder: impl Into<String>, stale_after: chrono::Duration) -> Self {
        Self {
            store,
            holder: holder.into(),
            stale_after,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// `Ok(None)` when another live holder has the lease.
    pub async fn acquire(&self) -> anyhow::Result<Option<MonitorJob>> {
        let now = Utc::now();
        let mut job = MonitorJob::queued(GLOBAL_TENANT, &self.holder, now);
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.progress.phase = "starting".into();

        match self.store.try_acquire_lease(&job, self.stale_after, now).await? {
            LeaseAttempt::Acquired { expired } => {
                if let Some(old) = expired {
                    counter!("lease_force_expired_total").increment(1);
                    tracing::warn!(target: "lease", expired = %old, holder = %self.holder, "stale lease force-expired");
                }
                tracing::debug!(target: "lease", lease = %job.id, holder = %self.holder, "lease acquired");
                Ok(Some(job))
            }
            LeaseAttempt::Held { holder, since } => {
                tracing::info!(target: "lease", %holder, %since, "lease held elsewhere");
                Ok(None)
            }
        }
    }

    /// Close the lease: `Succeeded`, or `Failed` with a truncated message.
    pub async fn release(&self, lease: &mut MonitorJob, result: Result<(), String>) -> anyhow::Result<()> {
        let now = Utc::now();
        match result {
            Ok(()) => lease.finish(JobStatus::Succeeded, None, now),
            Err(msg) => lease.finish(JobStatus::Failed, Some(truncate_message(&msg, MAX_ERROR_CHARS)), now),
        }
        self.store.update_job(lease).await?;
        tracing::debug!(target: "lease", lease = %lease.id, status = %lease.status, "lease released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running(started: DateTime<Utc>) -> MonitorJob {
        let mut j = MonitorJob::queued(GLOBAL_TENANT, "other:1", started);
        j.status = JobStatus::Running;
        j.started_at = Some(started);
        j
    }

    #[test]
    fn staleness_boundary() {
        let now = Utc::now();
        let th = Duration::minutes(30);
        assert!(!is_stale(now - Duration::minutes(30), now, th));
        assert!(is_stale(now - Duration::minutes(31), now, th));
        assert!(!is_stale(now, now, th));
    }

    #[test]
    fn worker_id_ends_with_pid() {
        assert!(worker_id().ends_with(&format!(":{}", std::process::id())));
    }

    #[test]
    fn evaluate_cases() {
        let now = Utc::now();
        let th = Duration::minutes(30);
        assert_eq!(evaluate(None, now, th), LeaseDecision::Acquire);
        assert_eq!(evaluate(Some(&running(now - Duration::minutes(5))), now, th), LeaseDecision::Held);
        assert_eq!(
            evaluate(Some(&running(now - Duration::hours(2))), now, th),
            LeaseDecision::ForceExpire
        );
    }
}
