// src/ingest/types.rs
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{FetchedArticle, SourceId};

/// Per-source result class of one fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Empty,
    Cached,
    Timeout,
    Error,
}

impl FetchStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Timeout | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Empty => "empty",
            Self::Cached => "cached",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchOutcome {
    pub source_id: SourceId,
    pub source_name: String,
    pub url: String,
    pub status: FetchStatus,
    pub article_count: usize,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Everything one `fetch_all` call produced.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub outcomes: Vec<FetchOutcome>,
    pub articles: Vec<FetchedArticle>,
}

impl FetchBatch {
    pub fn count(&self, status: FetchStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Cache validators remembered from a previous 200 response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Raw HTTP answer as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub status: u16,
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out")]
    Timeout,
    #[error("http status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("unparsable feed: {0}")]
    Parse(String),
}

impl FetchError {
    /// Retrying cannot change the answer.
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::Status(404) | Self::Status(410) | Self::Parse(_))
    }
}

/// HTTP access used by the fetcher. Split out so the fetcher can be driven by
/// fixtures in tests.
#[async_trait::async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
        timeout: Duration,
    ) -> Result<FeedResponse, FetchError>;

    fn name(&self) -> &'static str;
}
