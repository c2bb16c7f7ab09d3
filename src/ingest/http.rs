// src/ingest/http.rs
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};

use crate::ingest::host_of;
use crate::ingest::types::{FeedResponse, FeedTransport, FetchError, Validators};

pub const DEFAULT_USER_AGENT: &str = "feedwatch/0.1 (+rss keyword monitor)";

/// Real HTTP transport. Connection pooling is shared across all sources.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(5))
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client })
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
        timeout: Duration,
    ) -> Result<FeedResponse, FetchError> {
        let mut req = self
            .client
            .get(url)
            .timeout(timeout)
            .header(
                reqwest::header::ACCEPT,
                "application/rss+xml, application/atom+xml, application/xml;q=0.9, */*;q=0.8",
            );
        if let Some(etag) = validators.etag.as_deref() {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = validators.last_modified.as_deref() {
            req = req.header(IF_MODIFIED_SINCE, modified);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let etag = header_string(resp.headers(), ETAG);
        let last_modified = header_string(resp.headers(), LAST_MODIFIED);
        let body = if status == 304 {
            String::new()
        } else {
            resp.text().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(format!("reading body: {e}"))
                }
            })?
        };

        Ok(FeedResponse {
            status,
            body,
            etag,
            last_modified,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Scripted answer for one URL.
#[derive(Debug, Clone)]
pub enum FixtureReply {
    Ok { body: String, etag: Option<String> },
    Status(u16),
    Fail(FetchError),
    /// Sleep before answering 200 with `body` (used to trigger timeouts).
    Slow { body: String, delay: Duration },
}

/// Requests open right now and the most ever open, overall and per host.
#[derive(Default)]
struct InFlight {
    open: usize,
    peak: usize,
    hosts: HashMap<String, (usize, usize)>,
}

struct InFlightGuard<'a> {
    flight: &'a Mutex<InFlight>,
    host: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut f = self.flight.lock().unwrap_or_else(|p| p.into_inner());
        f.open = f.open.saturating_sub(1);
        if let Some(h) = f.hosts.get_mut(&self.host) {
            h.0 = h.0.saturating_sub(1);
        }
    }
}

/// Serves canned bodies by URL; records how often each URL was requested
/// and how many requests were in flight at once.
/// A URL with an etag answers 304 when the request carries the same etag.
#[derive(Default)]
pub struct FixtureTransport {
    replies: HashMap<String, FixtureReply>,
    calls: Mutex<HashMap<String, u32>>,
    last_validators: Mutex<HashMap<String, Validators>>,
    flight: Mutex<InFlight>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: &str, body: &str) -> Self {
        self.replies.insert(
            url.to_string(),
            FixtureReply::Ok {
                body: body.to_string(),
                etag: None,
            },
        );
        self
    }

    pub fn with_etag(mut self, url: &str, body: &str, etag: &str) -> Self {
        self.replies.insert(
            url.to_string(),
            FixtureReply::Ok {
                body: body.to_string(),
                etag: Some(etag.to_string()),
            },
        );
        self
    }

    pub fn with_reply(mut self, url: &str, reply: FixtureReply) -> Self {
        self.replies.insert(url.to_string(), reply);
        self
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls
            .lock()
            .map(|c| c.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn last_validators(&self, url: &str) -> Option<Validators> {
        self.last_validators
            .lock()
            .ok()
            .and_then(|v| v.get(url).cloned())
    }

    /// Most requests ever open at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.flight.lock().map(|f| f.peak).unwrap_or(0)
    }

    /// Most requests ever open at the same time against `host`.
    pub fn peak_in_flight_for(&self, host: &str) -> usize {
        self.flight
            .lock()
            .ok()
            .and_then(|f| f.hosts.get(host).map(|h| h.1))
            .unwrap_or(0)
    }

    fn enter(&self, url: &str) -> InFlightGuard<'_> {
        let host = host_of(url);
        let mut f = self.flight.lock().unwrap_or_else(|p| p.into_inner());
        f.open += 1;
        f.peak = f.peak.max(f.open);
        let h = f.hosts.entry(host.clone()).or_insert((0, 0));
        h.0 += 1;
        h.1 = h.1.max(h.0);
        InFlightGuard {
            flight: &self.flight,
            host,
        }
    }
}

#[async_trait]
impl FeedTransport for FixtureTransport {
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
        _timeout: Duration,
    ) -> Result<FeedResponse, FetchError> {
        if let Ok(mut c) = self.calls.lock() {
            *c.entry(url.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut v) = self.last_validators.lock() {
            v.insert(url.to_string(), validators.clone());
        }
        let _open = self.enter(url);

        match self.replies.get(url) {
            None => Err(FetchError::Network(format!("no route to {url}"))),
            Some(FixtureReply::Ok { body, etag }) => {
                if etag.is_some() && validators.etag == *etag {
                    return Ok(FeedResponse {
                        status: 304,
                        body: String::new(),
                        etag: etag.clone(),
                        last_modified: None,
                    });
                }
                Ok(FeedResponse {
                    status: 200,
                    body: body.clone(),
                    etag: etag.clone(),
                    last_modified: None,
                })
            }
            Some(FixtureReply::Status(code)) => Ok(FeedResponse {
                status: *code,
                body: String::new(),
                etag: None,
                last_modified: None,
            }),
            Some(FixtureReply::Fail(e)) => Err(e.clone()),
            Some(FixtureReply::Slow { body, delay }) => {
                tokio::time::sleep(*delay).await;
                Ok(FeedResponse {
                    status: 200,
                    body: body.clone(),
                    etag: None,
                    last_modified: None,
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
