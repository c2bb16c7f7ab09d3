// src/types.rs
//! Shared records passed between the fetcher, the matching engine, the balancer
//! and the persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TenantId = i64;
pub type SourceId = i64;

/// Tenant id recorded on orchestrator (fleet-wide) jobs. The RUNNING job with
/// this tenant is the cross-process lease.
pub const GLOBAL_TENANT: TenantId = 0;

/// One entry of the shared source catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: SourceId,
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_true() -> bool {
    true
}

/// Fixed-language translation columns stored alongside a keyword.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordTranslations {
    #[serde(default)]
    pub ar: Option<String>,
    #[serde(default)]
    pub en: Option<String>,
    #[serde(default)]
    pub fr: Option<String>,
}

impl KeywordTranslations {
    /// Non-empty columns as `(lang, text)` pairs.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        [("ar", &self.ar), ("en", &self.en), ("fr", &self.fr)]
            .into_iter()
            .filter_map(|(lang, v)| {
                v.as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| (lang, t))
            })
            .collect()
    }
}

/// Tenant-owned keyword.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Keyword {
    pub id: i64,
    pub tenant_id: TenantId,
    pub text: String,
    #[serde(default)]
    pub translations: KeywordTranslations,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Article as parsed from a feed. Lives only for the duration of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchedArticle {
    pub title: String,
    pub summary: String,
    pub content: Option<String>,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_id: SourceId,
    pub source_name: String,
    pub country: String,
    pub image_url: Option<String>,
}

impl FetchedArticle {
    /// Title, summary and content joined with newlines. Match offsets are char
    /// offsets into this string.
    pub fn searchable_text(&self) -> String {
        let mut out = String::with_capacity(
            self.title.len() + self.summary.len() + self.content.as_ref().map_or(0, |c| c.len()) + 2,
        );
        out.push_str(&self.title);
        if !self.summary.is_empty() {
            out.push('\n');
            out.push_str(&self.summary);
        }
        if let Some(c) = self.content.as_deref().filter(|c| !c.is_empty()) {
            out.push('\n');
            out.push_str(c);
        }
        out
    }
}

/// One variant of a keyword found in an article.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantHit {
    pub variant: String,
    pub language: String,
    /// Char offset into `FetchedArticle::searchable_text`.
    pub offset: usize,
    /// Length in chars of the matched span in the searchable text.
    pub length: usize,
}

/// Every variant of one keyword that matched an article.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordMatch {
    pub keyword: String,
    pub hits: Vec<VariantHit>,
}

impl KeywordMatch {
    /// Earliest hit in the text.
    pub fn primary(&self) -> Option<&VariantHit> {
        self.hits.iter().min_by_key(|h| h.offset)
    }
}

/// An article plus every keyword it matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub article: FetchedArticle,
    /// Detected dominant language of the article text.
    pub language: String,
    pub matches: Vec<KeywordMatch>,
}

impl MatchRecord {
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.matches.iter().map(|m| m.keyword.as_str())
    }
}

/// Stored, tenant-scoped copy of a matched article. Unique on `(tenant_id, url)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedArticle {
    pub tenant_id: TenantId,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub title_translated: Option<String>,
    pub summary_translated: Option<String>,
    pub source_id: SourceId,
    pub source_name: String,
    pub country: String,
    pub language: String,
    pub published_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    pub matched_keywords: Vec<String>,
    pub match_context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of one insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub phase: String,
    pub percent: u8,
    pub fetched: usize,
    pub matched: usize,
    pub saved: usize,
}

/// Persisted state of one monitoring run (tenant job or global cycle).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorJob {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub progress: JobProgress,
    /// Worker that created the job (hostname:pid).
    pub holder: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MonitorJob {
    pub fn queued(tenant_id: TenantId, holder: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            status: JobStatus::Queued,
            progress: JobProgress {
                phase: "queued".into(),
                ..JobProgress::default()
            },
            holder: holder.to_string(),
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.tenant_id == GLOBAL_TENANT
    }

    pub fn finish(&mut self, status: JobStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        if status == JobStatus::Succeeded {
            self.progress.percent = 100;
            self.progress.phase = "done".into();
        }
    }
}

/// Upper bound for second-valued settings (ten years).
pub const MAX_CONFIG_SECS: u64 = 10 * 365 * 24 * 3600;

/// Seconds from config as a `chrono::Duration`, capped at `MAX_CONFIG_SECS`
/// so timestamp arithmetic with it cannot overflow.
pub fn config_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_CONFIG_SECS) as i64)
}

/// Cap error messages stored on job records.
pub fn truncate_message(msg: &str, max_chars: usize) -> String {
    if msg.chars().count() <= max_chars {
        return msg.to_string();
    }
    let mut out: String = msg.chars().take(max_chars).collect();
    out.push('…');
    out
}
