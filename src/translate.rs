// src/translate.rs
//! Translation capability: trait + concrete translators.
//!
//! * `DisabledTranslator`: every call fails with `Disabled`; expansions then
//!   rely on keyword hint columns and the proper-noun table only.
//! * `HttpTranslator`: LibreTranslate-compatible JSON API.
//! * `StaticTranslator`: table lookups, used in tests and `TRANSLATE_TEST_MODE=static`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("translation is disabled")]
    Disabled,
    #[error("target language `{0}` is not supported")]
    Unsupported(String),
    #[error("translation request failed: {0}")]
    Transport(String),
    #[error("translation service answered {0}")]
    Status(u16),
    #[error("malformed translation response: {0}")]
    Decode(String),
    #[error("translation came back empty")]
    Empty,
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into `target` (ISO 639-1 code). Source language is auto-detected.
    async fn translate(&self, text: &str, target: &str) -> Result<String, TranslateError>;
    fn name(&self) -> &'static str;
}

pub type DynTranslator = Arc<dyn Translator>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// "disabled" | "libretranslate" | "static" (case-insensitive)
    pub provider: String,
    pub endpoint: String,
    /// "ENV" means: read from TRANSLATE_API_KEY
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".into(),
            endpoint: "http://127.0.0.1:5000/translate".into(),
            api_key: String::new(),
            timeout_secs: 10,
        }
    }
}

/// Factory: build a translator according to config and environment.
///
/// * `TRANSLATE_TEST_MODE=static` wins and returns a seeded `StaticTranslator`.
/// * Unknown providers fall back to disabled with a warning.
pub fn build_translator(cfg: &TranslatorConfig) -> anyhow::Result<DynTranslator> {
    if std::env::var("TRANSLATE_TEST_MODE")
        .map(|v| v.eq_ignore_ascii_case("static"))
        .unwrap_or(false)
    {
        return Ok(Arc::new(StaticTranslator::seeded()));
    }

    match cfg.provider.trim().to_ascii_lowercase().as_str() {
        "" | "disabled" | "none" => Ok(Arc::new(DisabledTranslator)),
        "static" => Ok(Arc::new(StaticTranslator::seeded())),
        "libretranslate" | "http" => {
            let api_key = if cfg.api_key.trim().eq_ignore_ascii_case("env") {
                Some(
                    std::env::var("TRANSLATE_API_KEY")
                        .map_err(|_| anyhow::anyhow!("Missing TRANSLATE_API_KEY env var"))?,
                )
            } else if cfg.api_key.trim().is_empty() {
                None
            } else {
                Some(cfg.api_key.trim().to_string())
            };
            Ok(Arc::new(HttpTranslator::new(
                &cfg.endpoint,
                api_key,
                Duration::from_secs(cfg.timeout_secs.max(1)),
            )?))
        }
        other => {
            tracing::warn!(target: "translate", provider = other, "unknown translator provider, translation disabled");
            Ok(Arc::new(DisabledTranslator))
        }
    }
}

pub struct DisabledTranslator;

#[async_trait]
impl Translator for DisabledTranslator {
    async fn translate(&self, _text: &str, _target: &str) -> Result<String, TranslateError> {
        Err(TranslateError::Disabled)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Table-driven translator. Lookups are keyed by lowercased source text.
#[derive(Default)]
pub struct StaticTranslator {
    table: HashMap<(String, String), String>,
    failing: HashSet<String>,
    echo: bool,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handful of entries for demo/test mode.
    pub fn seeded() -> Self {
        Self::new()
            .with_entry("مصر", "en", "Egypt")
            .with_entry("مصر", "fr", "Égypte")
            .with_entry("egypt", "ar", "مصر")
            .with_entry("egypt", "fr", "Égypte")
            .with_entry("france", "ar", "فرنسا")
            .with_entry("france", "fr", "France")
    }

    pub fn with_entry(mut self, text: &str, target: &str, out: &str) -> Self {
        self.table
            .insert((text.trim().to_lowercase(), target.to_string()), out.to_string());
        self
    }

    /// Every request for `target` fails.
    pub fn failing_for(mut self, target: &str) -> Self {
        self.failing.insert(target.to_string());
        self
    }

    /// Unknown entries come back as `[target] text` instead of failing.
    pub fn echo_unknown(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Every request waits `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Translator for StaticTranslator {
    async fn translate(&self, text: &str, target: &str) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.contains(target) {
            return Err(TranslateError::Transport(format!("static failure for {target}")));
        }
        match self.table.get(&(text.trim().to_lowercase(), target.to_string())) {
            Some(out) => Ok(out.clone()),
            None if self.echo => Ok(format!("[{target}] {text}")),
            None => Err(TranslateError::Unsupported(target.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Serialize)]
struct LibreRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct LibreResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// LibreTranslate-compatible HTTP translator.
pub struct HttpTranslator {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTranslator {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::ingest::http::DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, target: &str) -> Result<String, TranslateError> {
        let body = LibreRequest {
            q: text,
            source: "auto",
            target,
            format: "text",
            api_key: self.api_key.as_deref(),
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| TranslateError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 400 {
            return Err(TranslateError::Unsupported(target.to_string()));
        }
        if !status.is_success() {
            return Err(TranslateError::Status(status.as_u16()));
        }
        let parsed: LibreResponse = resp
            .json()
            .await
            .map_err(|e| TranslateError::Decode(e.to_string()))?;
        let out = parsed.translated_text.trim().to_string();
        if out.is_empty() {
            return Err(TranslateError::Empty);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "libretranslate"
    }
}
