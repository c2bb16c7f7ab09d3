// src/ingest/fetcher.rs
//! Concurrent feed fetcher.
//!
//! - A process-wide semaphore caps open requests regardless of how many
//!   sources a batch has; a per-host semaphore keeps any single origin from
//!   being hammered.
//! - Timeouts depend on the host: known-fast hosts get a short one, known-slow
//!   hosts a long one.
//! - Transient failures are retried with exponential backoff; 404/410 and
//!   unparsable payloads are not.
//! - ETag / Last-Modified from the previous 200 are replayed so unchanged
//!   feeds come back as `cached`. Only `FetchMode::Conditional` and
//!   `FetchMode::Refresh` touch the stored validators; tenant jobs fetch in
//!   `FetchMode::Full` and leave them to the global cycle.
//!
//! Articles are not deduplicated across runs here; persistence owns that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::ingest::http::DEFAULT_USER_AGENT;
use crate::ingest::types::{
    FeedResponse, FeedTransport, FetchBatch, FetchError, FetchOutcome, FetchStatus, Validators,
};
use crate::ingest::{host_of, parser};
use crate::types::{FetchedArticle, Source};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub max_concurrency: usize,
    pub per_host_concurrency: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub default_timeout_secs: u64,
    pub fast_timeout_secs: u64,
    pub slow_timeout_secs: u64,
    pub fast_domains: Vec<String>,
    pub slow_domains: Vec<String>,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 20,
            per_host_concurrency: 2,
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            default_timeout_secs: 15,
            fast_timeout_secs: 8,
            slow_timeout_secs: 30,
            fast_domains: vec![
                "bbc.co.uk".into(),
                "reuters.com".into(),
                "aljazeera.com".into(),
                "france24.com".into(),
            ],
            slow_domains: vec![],
            user_agent: DEFAULT_USER_AGENT.into(),
        }
    }
}

/// `base * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

fn domain_matches(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|d| {
        let d = d.trim().trim_start_matches("www.").to_ascii_lowercase();
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    })
}

/// How stored cache validators are used for one fetch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Replay stored validators; unchanged feeds come back `Cached`.
    Conditional,
    /// Download every feed and store the new validators.
    Refresh,
    /// Download every feed; stored validators are neither sent nor updated.
    Full,
}

struct Permits {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

pub struct FeedFetcher {
    transport: Arc<dyn FeedTransport>,
    cfg: FetcherConfig,
    global: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    validators: Mutex<HashMap<String, Validators>>,
}

impl FeedFetcher {
    pub fn new(transport: Arc<dyn FeedTransport>, cfg: FetcherConfig) -> Self {
        Self {
            transport,
            global: Arc::new(Semaphore::new(cfg.max_concurrency.max(1))),
            per_host: Mutex::new(HashMap::new()),
            validators: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.cfg
    }

    /// Timeout for a host: slow list wins over fast list, otherwise the default.
    pub fn timeout_for(&self, host: &str) -> Duration {
        let secs = if domain_matches(host, &self.cfg.slow_domains) {
            self.cfg.slow_timeout_secs
        } else if domain_matches(host, &self.cfg.fast_domains) {
            self.cfg.fast_timeout_secs
        } else {
            self.cfg.default_timeout_secs
        };
        Duration::from_secs(secs.max(1))
    }

    /// Conditional fetch of every source. Never fails as a whole: each source
    /// ends up with exactly one outcome, in input order.
    pub async fn fetch_all(&self, sources: &[Source]) -> FetchBatch {
        self.fetch_all_with(sources, FetchMode::Conditional).await
    }

    pub async fn fetch_all_with(&self, sources: &[Source], mode: FetchMode) -> FetchBatch {
        crate::metrics::ensure_metrics_described();
        let t0 = Instant::now();

        let mut results: Vec<(usize, FetchOutcome, Vec<FetchedArticle>)> =
            stream::iter(0..sources.len())
                .map(|i| {
                    let s = &sources[i];
                    async move {
                        let (outcome, articles) = self.fetch_one(s, mode).await;
                        (i, outcome, articles)
                    }
                })
                .buffer_unordered(self.cfg.max_concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(i, _, _)| *i);

        let mut batch = FetchBatch::default();
        for (_, outcome, mut articles) in results {
            batch.articles.append(&mut articles);
            batch.outcomes.push(outcome);
        }

        tracing::info!(
            target: "fetcher",
            sources = sources.len(),
            ?mode,
            articles = batch.articles.len(),
            success = batch.count(FetchStatus::Success),
            empty = batch.count(FetchStatus::Empty),
            cached = batch.count(FetchStatus::Cached),
            timeout = batch.count(FetchStatus::Timeout),
            error = batch.count(FetchStatus::Error),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "fetch batch done"
        );
        batch
    }

    /// Host permit first, so a request queued behind its host never sits on
    /// a global slot.
    async fn acquire(&self, host: &str) -> Result<Permits, FetchError> {
        let host_sem = {
            let mut map = self
                .per_host
                .lock()
                .map_err(|_| FetchError::Network("host limiter poisoned".into()))?;
            map.entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.cfg.per_host_concurrency.max(1))))
                .clone()
        };
        let host = host_sem
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Network("host limiter closed".into()))?;
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Network("global limiter closed".into()))?;
        Ok(Permits {
            _global: global,
            _host: host,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        host: &str,
        validators: &Validators,
        timeout: Duration,
    ) -> Result<FeedResponse, FetchError> {
        let _permits = self.acquire(host).await?;
        match tokio::time::timeout(timeout, self.transport.get(url, validators, timeout)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    fn validators_for(&self, url: &str) -> Validators {
        self.validators
            .lock()
            .ok()
            .and_then(|m| m.get(url).cloned())
            .unwrap_or_default()
    }

    fn remember_validators(&self, url: &str, resp: &FeedResponse) {
        let v = Validators {
            etag: resp.etag.clone(),
            last_modified: resp.last_modified.clone(),
        };
        if let Ok(mut m) = self.validators.lock() {
            if v.is_empty() {
                m.remove(url);
            } else {
                m.insert(url.to_string(), v);
            }
        }
    }

    async fn fetch_one(&self, source: &Source, mode: FetchMode) -> (FetchOutcome, Vec<FetchedArticle>) {
        let started = Instant::now();
        let host = host_of(&source.url);
        let timeout = self.timeout_for(&host);
        let validators = match mode {
            FetchMode::Conditional => self.validators_for(&source.url),
            FetchMode::Refresh | FetchMode::Full => Validators::default(),
        };
        let mut attempts = 0u32;

        let error = loop {
            attempts += 1;
            let err = match self.attempt(&source.url, &host, &validators, timeout).await {
                Ok(resp) if resp.status == 304 => {
                    return self.finish(source, FetchStatus::Cached, attempts, started, None, vec![]);
                }
                Ok(resp) if (200..300).contains(&resp.status) => {
                    if mode != FetchMode::Full {
                        self.remember_validators(&source.url, &resp);
                    }
                    return match parser::parse_feed(&resp.body, source) {
                        Ok(articles) => {
                            let status = if articles.is_empty() {
                                FetchStatus::Empty
                            } else {
                                FetchStatus::Success
                            };
                            self.finish(source, status, attempts, started, None, articles)
                        }
                        Err(e) => {
                            let err = FetchError::Parse(format!("{e:#}"));
                            self.finish(source, FetchStatus::Error, attempts, started, Some(err), vec![])
                        }
                    };
                }
                Ok(resp) => FetchError::Status(resp.status),
                Err(e) => e,
            };

            if err.is_definitive() || attempts > self.cfg.max_retries {
                break err;
            }
            let delay = backoff_delay(attempts - 1, self.cfg.backoff_base_ms, self.cfg.backoff_max_ms);
            tracing::debug!(
                target: "fetcher",
                source = %source.name,
                attempt = attempts,
                error = %err,
                backoff_ms = delay.as_millis() as u64,
                "retrying feed"
            );
            tokio::time::sleep(delay).await;
        };

        let status = if error == FetchError::Timeout {
            FetchStatus::Timeout
        } else {
            FetchStatus::Error
        };
        self.finish(source, status, attempts, started, Some(error), vec![])
    }

    fn finish(
        &self,
        source: &Source,
        status: FetchStatus,
        attempts: u32,
        started: Instant,
        error: Option<FetchError>,
        articles: Vec<FetchedArticle>,
    ) -> (FetchOutcome, Vec<FetchedArticle>) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        counter!("feed_fetch_total", "status" => status.as_str()).increment(1);
        histogram!("feed_fetch_ms").record(elapsed_ms as f64);
        if let Some(e) = &error {
            counter!("feed_fetch_errors_total").increment(1);
            tracing::warn!(
                target: "fetcher",
                source = %source.name,
                url = %source.url,
                attempts,
                error = %e,
                "feed fetch failed"
            );
        }
        let outcome = FetchOutcome {
            source_id: source.id,
            source_name: source.name.clone(),
            url: source.url.clone(),
            status,
            article_count: articles.len(),
            attempts,
            elapsed_ms,
            error: error.map(|e| e.to_string()),
        };
        (outcome, articles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::http::{FixtureReply, FixtureTransport};

    const FEED: &str = r#"<rss><channel>
<item><title>One</title><link>https://a.test/1</link></item>
<item><title>Two</title><link>https://a.test/2</link></item>
</channel></rss>"#;

    fn source(id: i64, url: &str) -> Source {
        Source {
            id,
            url: url.into(),
            name: format!("source-{id}"),
            country: "US".into(),
            enabled: true,
            consecutive_failures: 0,
        }
    }

    fn quick_cfg() -> FetcherConfig {
        FetcherConfig {
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            ..FetcherConfig::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0, 100, 1_000), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, 100, 1_000), Duration::from_millis(400));
        assert_eq!(backoff_delay(10, 100, 1_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(200, 100, 1_000), Duration::from_millis(1_000));
    }

    #[test]
    fn adaptive_timeout_by_domain() {
        let cfg = FetcherConfig {
            fast_domains: vec!["fast.test".into()],
            slow_domains: vec!["slow.test".into()],
            fast_timeout_secs: 3,
            slow_timeout_secs: 40,
            default_timeout_secs: 12,
            ..FetcherConfig::default()
        };
        let f = FeedFetcher::new(Arc::new(FixtureTransport::new()), cfg);
        assert_eq!(f.timeout_for("fast.test"), Duration::from_secs(3));
        assert_eq!(f.timeout_for("feeds.fast.test"), Duration::from_secs(3));
        assert_eq!(f.timeout_for("slow.test"), Duration::from_secs(40));
        assert_eq!(f.timeout_for("notfast.test"), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let t = Arc::new(FixtureTransport::new().with_reply("https://gone.test/rss", FixtureReply::Status(404)));
        let f = FeedFetcher::new(t.clone(), quick_cfg());
        let batch = f.fetch_all(&[source(1, "https://gone.test/rss")]).await;
        assert_eq!(batch.outcomes[0].status, FetchStatus::Error);
        assert_eq!(batch.outcomes[0].attempts, 1);
        assert_eq!(t.calls("https://gone.test/rss"), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_limit() {
        let t = Arc::new(FixtureTransport::new().with_reply("https://flaky.test/rss", FixtureReply::Status(503)));
        let f = FeedFetcher::new(t.clone(), quick_cfg());
        let batch = f.fetch_all(&[source(1, "https://flaky.test/rss")]).await;
        assert_eq!(batch.outcomes[0].status, FetchStatus::Error);
        assert_eq!(t.calls("https://flaky.test/rss"), 3);
        assert!(batch.outcomes[0].error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn unchanged_feed_comes_back_cached() {
        let url = "https://etag.test/rss";
        let t = Arc::new(FixtureTransport::new().with_etag(url, FEED, "\"v1\""));
        let f = FeedFetcher::new(t.clone(), quick_cfg());

        let first = f.fetch_all(&[source(1, url)]).await;
        assert_eq!(first.outcomes[0].status, FetchStatus::Success);
        assert_eq!(first.articles.len(), 2);

        let second = f.fetch_all(&[source(1, url)]).await;
        assert_eq!(second.outcomes[0].status, FetchStatus::Cached);
        assert!(second.articles.is_empty());
        assert_eq!(t.last_validators(url).unwrap().etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn full_fetch_ignores_and_keeps_validators() {
        let url = "https://etag.test/rss";
        let t = Arc::new(FixtureTransport::new().with_etag(url, FEED, "\"v1\""));
        let f = FeedFetcher::new(t.clone(), quick_cfg());

        // nothing stored yet, so a full fetch must not plant "v1"
        let full = f.fetch_all_with(&[source(1, url)], FetchMode::Full).await;
        assert_eq!(full.outcomes[0].status, FetchStatus::Success);
        let cond = f.fetch_all(&[source(1, url)]).await;
        assert_eq!(cond.outcomes[0].status, FetchStatus::Success);

        let full = f.fetch_all_with(&[source(1, url)], FetchMode::Full).await;
        assert_eq!(full.articles.len(), 2);
        assert!(t.last_validators(url).unwrap().etag.is_none());
        // the stored validators survived the full fetch
        let cond = f.fetch_all(&[source(1, url)]).await;
        assert_eq!(cond.outcomes[0].status, FetchStatus::Cached);
    }

    #[tokio::test]
    async fn refresh_downloads_and_stores_validators() {
        let url = "https://etag.test/rss";
        let t = Arc::new(FixtureTransport::new().with_etag(url, FEED, "\"v1\""));
        let f = FeedFetcher::new(t.clone(), quick_cfg());

        f.fetch_all(&[source(1, url)]).await;
        let refreshed = f.fetch_all_with(&[source(1, url)], FetchMode::Refresh).await;
        assert_eq!(refreshed.outcomes[0].status, FetchStatus::Success);
        assert_eq!(refreshed.articles.len(), 2);
        assert_eq!(f.fetch_all(&[source(1, url)]).await.outcomes[0].status, FetchStatus::Cached);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        let url = "https://slow.test/rss";
        let t = Arc::new(FixtureTransport::new().with_reply(
            url,
            FixtureReply::Slow {
                body: FEED.into(),
                delay: Duration::from_secs(120),
            },
        ));
        let cfg = FetcherConfig {
            max_retries: 1,
            default_timeout_secs: 2,
            ..quick_cfg()
        };
        let f = FeedFetcher::new(t.clone(), cfg);
        let batch = f.fetch_all(&[source(1, url)]).await;
        assert_eq!(batch.outcomes[0].status, FetchStatus::Timeout);
        assert_eq!(batch.outcomes[0].attempts, 2);
    }

    #[tokio::test]
    async fn garbage_payload_is_an_error_without_retry() {
        let url = "https://html.test/";
        let t = Arc::new(FixtureTransport::new().with_body(url, "<html><body>hi</body></html>"));
        let f = FeedFetcher::new(t.clone(), quick_cfg());
        let batch = f.fetch_all(&[source(1, url)]).await;
        assert_eq!(batch.outcomes[0].status, FetchStatus::Error);
        assert_eq!(t.calls(url), 1);
    }
}
