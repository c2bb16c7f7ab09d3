// src/store.rs
//! Persistence capabilities consumed by the engine, plus an in-memory
//! implementation used by the standalone binary and the tests.
//!
//! The catalog (sources, keywords) belongs to external collaborators; the
//! engine only reads it, except for the per-source failure counter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lease::{evaluate, LeaseAttempt, LeaseDecision};
use crate::types::{
    Keyword, MonitorJob, PersistedArticle, SaveOutcome, Source, SourceId, TenantId, JobStatus, GLOBAL_TENANT,
};

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn enabled_sources(&self) -> Result<Vec<Source>>;
    /// Sources a tenant follows; the full enabled catalog when it has no
    /// explicit subscription list.
    async fn tenant_sources(&self, tenant: TenantId) -> Result<Vec<Source>>;
    /// Enabled keywords of every tenant.
    async fn enabled_keywords(&self) -> Result<Vec<Keyword>>;
    async fn tenant_keywords(&self, tenant: TenantId) -> Result<Vec<Keyword>>;
    async fn record_source_failures(&self, updates: &[(SourceId, u32)]) -> Result<()>;
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn exists(&self, tenant: TenantId, url: &str) -> Result<bool>;
    /// Insert unless `(tenant, url)` is already stored.
    async fn create(&self, article: PersistedArticle) -> Result<SaveOutcome>;
    /// Tenant reset. Returns the number of rows removed.
    async fn delete_for_tenant(&self, tenant: TenantId) -> Result<usize>;
    async fn count_for_tenant(&self, tenant: TenantId) -> Result<usize>;
    /// Newest first.
    async fn list_for_tenant(&self, tenant: TenantId, limit: usize) -> Result<Vec<PersistedArticle>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &MonitorJob) -> Result<()>;
    async fn update_job(&self, job: &MonitorJob) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<MonitorJob>>;
    /// Newest first.
    async fn list_jobs(&self, tenant: TenantId, limit: usize) -> Result<Vec<MonitorJob>>;
    async fn active_job_for_tenant(&self, tenant: TenantId) -> Result<Option<MonitorJob>>;
    /// Creation times of the tenant's jobs created at or after `since`.
    async fn job_times_since(&self, tenant: TenantId, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>>;
    /// Every QUEUED or RUNNING job.
    async fn non_terminal_jobs(&self) -> Result<Vec<MonitorJob>>;
    async fn running_global(&self) -> Result<Option<MonitorJob>>;
    /// Atomically: look at the current RUNNING global job, force-expire it if
    /// stale, and insert `candidate` unless a live lease exists.
    async fn try_acquire_lease(
        &self,
        candidate: &MonitorJob,
        stale_after: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseAttempt>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<Source>,
    keywords: Vec<Keyword>,
    subscriptions: HashMap<TenantId, Vec<SourceId>>,
    articles: HashMap<(TenantId, String), PersistedArticle>,
    jobs: HashMap<Uuid, MonitorJob>,
}

impl MemoryState {
    fn running_global(&self) -> Option<&MonitorJob> {
        self.jobs
            .values()
            .filter(|j| j.tenant_id == GLOBAL_TENANT && j.status == JobStatus::Running)
            .max_by_key(|j| j.started_at.unwrap_or(j.created_at))
    }
}

/// Everything in one mutex; no lock is held across an await.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(sources: Vec<Source>, keywords: Vec<Keyword>) -> Self {
        let s = Self::new();
        {
            let mut st = s.lock();
            st.sources = sources;
            st.keywords = keywords;
        }
        s
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_source(&self, source: Source) {
        self.lock().sources.push(source);
    }

    pub fn add_keyword(&self, keyword: Keyword) {
        self.lock().keywords.push(keyword);
    }

    pub fn subscribe(&self, tenant: TenantId, sources: Vec<SourceId>) {
        self.lock().subscriptions.insert(tenant, sources);
    }

    pub fn source(&self, id: SourceId) -> Option<Source> {
        self.lock().sources.iter().find(|s| s.id == id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn enabled_sources(&self) -> Result<Vec<Source>> {
        Ok(self.lock().sources.iter().filter(|s| s.enabled).cloned().collect())
    }

    async fn tenant_sources(&self, tenant: TenantId) -> Result<Vec<Source>> {
        let st = self.lock();
        let enabled = st.sources.iter().filter(|s| s.enabled);
        Ok(match st.subscriptions.get(&tenant) {
            Some(ids) => enabled.filter(|s| ids.contains(&s.id)).cloned().collect(),
            None => enabled.cloned().collect(),
        })
    }

    async fn enabled_keywords(&self) -> Result<Vec<Keyword>> {
        Ok(self.lock().keywords.iter().filter(|k| k.enabled).cloned().collect())
    }

    async fn tenant_keywords(&self, tenant: TenantId) -> Result<Vec<Keyword>> {
        Ok(self
            .lock()
            .keywords
            .iter()
            .filter(|k| k.enabled && k.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn record_source_failures(&self, updates: &[(SourceId, u32)]) -> Result<()> {
        let mut st = self.lock();
        for (id, failures) in updates {
            if let Some(s) = st.sources.iter_mut().find(|s| s.id == *id) {
                s.consecutive_failures = *failures;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn exists(&self, tenant: TenantId, url: &str) -> Result<bool> {
        Ok(self.lock().articles.contains_key(&(tenant, url.to_string())))
    }

    async fn create(&self, article: PersistedArticle) -> Result<SaveOutcome> {
        let mut st = self.lock();
        let key = (article.tenant_id, article.url.clone());
        if st.articles.contains_key(&key) {
            return Ok(SaveOutcome::Duplicate);
        }
        st.articles.insert(key, article);
        Ok(SaveOutcome::Inserted)
    }

    async fn delete_for_tenant(&self, tenant: TenantId) -> Result<usize> {
        let mut st = self.lock();
        let before = st.articles.len();
        st.articles.retain(|(t, _), _| *t != tenant);
        Ok(before - st.articles.len())
    }

    async fn count_for_tenant(&self, tenant: TenantId) -> Result<usize> {
        Ok(self.lock().articles.keys().filter(|(t, _)| *t == tenant).count())
    }

    async fn list_for_tenant(&self, tenant: TenantId, limit: usize) -> Result<Vec<PersistedArticle>> {
        let st = self.lock();
        let mut out: Vec<PersistedArticle> = st
            .articles
            .values()
            .filter(|a| a.tenant_id == tenant)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &MonitorJob) -> Result<()> {
        let mut st = self.lock();
        if st.jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        st.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &MonitorJob) -> Result<()> {
        let mut st = self.lock();
        match st.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => anyhow::bail!("job {} not found", job.id),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<MonitorJob>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, tenant: TenantId, limit: usize) -> Result<Vec<MonitorJob>> {
        let st = self.lock();
        let mut out: Vec<MonitorJob> = st.jobs.values().filter(|j| j.tenant_id == tenant).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn active_job_for_tenant(&self, tenant: TenantId) -> Result<Option<MonitorJob>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant && !j.status.is_terminal())
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn job_times_since(&self, tenant: TenantId, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        let st = self.lock();
        let mut out: Vec<DateTime<Utc>> = st
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant && j.created_at >= since)
            .map(|j| j.created_at)
            .collect();
        out.sort();
        Ok(out)
    }

    async fn non_terminal_jobs(&self) -> Result<Vec<MonitorJob>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn running_global(&self) -> Result<Option<MonitorJob>> {
        Ok(self.lock().running_global().cloned())
    }

    async fn try_acquire_lease(
        &self,
        candidate: &MonitorJob,
        stale_after: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseAttempt> {
        let mut st = self.lock();
        let existing = st.running_global().cloned();
        let expired = match evaluate(existing.as_ref(), now, stale_after) {
            LeaseDecision::Held => {
                let job = existing.as_ref().map(|j| (j.holder.clone(), j.started_at.unwrap_or(j.created_at)));
                let (holder, since) = job.unwrap_or_else(|| (String::new(), now));
                return Ok(LeaseAttempt::Held { holder, since });
            }
            LeaseDecision::ForceExpire => existing.map(|old| {
                if let Some(j) = st.jobs.get_mut(&old.id) {
                    j.finish(JobStatus::Failed, Some("lease expired (holder presumed dead)".into()), now);
                }
                old.id
            }),
            LeaseDecision::Acquire => None,
        };
        st.jobs.insert(candidate.id, candidate.clone());
        Ok(LeaseAttempt::Acquired { expired })
    }
}
