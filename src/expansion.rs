// src/expansion.rs
//! # Keyword Expansion Cache
//!
//! Expands one canonical keyword into per-language literal variants.
//!
//! - Write side (`refresh`, `warm`, the background refresher) calls the
//!   translator.
//! - Read side (`get`) never translates.
//! - `warm_bounded` is what cycles and jobs call: stale entries are refreshed
//!   on a detached task, and only keywords with no usable entry are waited
//!   for, at most `warm_budget_ms`. A down translator therefore delays a cycle
//!   by the budget at worst, and not at all once every keyword has been
//!   expanded once.
//! - A keyword is refreshed by one task at a time.
//! - Proper nouns listed in a curated table get their pinned forms instead of
//!   machine translation for the languages the table covers.
//! - Keyword hint columns (ar/en/fr) are used as-is for their language.
//!
//! Entries are keyed by the normalized keyword text and shared by every tenant
//! owning that text.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::matching::lang::detect_language;
use crate::matching::normalize::{normalize, Script};
use crate::store::CatalogStore;
use crate::translate::{DynTranslator, TranslateError};
use crate::types::{config_secs, Keyword, KeywordTranslations};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionStatus {
    Complete,
    Partial,
    Failed,
}

impl ExpansionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordExpansion {
    pub keyword: String,
    /// Language the canonical text is written in (`"und"` when unclear).
    pub keyword_language: String,
    /// Target language -> literal variant.
    pub variants: BTreeMap<String, String>,
    pub proper_noun: bool,
    pub status: ExpansionStatus,
    pub refreshed_at: DateTime<Utc>,
}

impl KeywordExpansion {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.refreshed_at < ttl
    }

    /// Failed expansions are skipped by callers.
    pub fn is_usable(&self) -> bool {
        self.status != ExpansionStatus::Failed && !self.variants.is_empty()
    }

    /// Every variant as `(language, text)`, the canonical text included under
    /// its own language when no target language already carries it.
    pub fn all_variants(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .variants
            .iter()
            .map(|(l, v)| (l.as_str(), v.as_str()))
            .collect();
        if self.is_usable() && !self.variants.values().any(|v| v == &self.keyword) {
            out.push((self.keyword_language.as_str(), self.keyword.as_str()));
        }
        out
    }
}

/// Language of a bare keyword. Short strings rarely carry stop words, so the
/// script decides first.
pub fn keyword_language(text: &str) -> String {
    match Script::of(text) {
        Script::Arabic => "ar".to_string(),
        _ => detect_language(text).to_string(),
    }
}

// ------------------------------------------------------------
// Proper-noun table
// ------------------------------------------------------------

/// Curated literal forms for names that machine translation tends to mangle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProperNounTable {
    /// Canonical name -> language -> pinned form.
    #[serde(default)]
    pub entries: HashMap<String, BTreeMap<String, String>>,
    #[serde(skip)]
    index: HashMap<String, String>,
}

impl ProperNounTable {
    pub fn from_entries(entries: HashMap<String, BTreeMap<String, String>>) -> Self {
        let mut t = Self {
            entries,
            index: HashMap::new(),
        };
        t.reindex();
        t
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (canon, forms) in &self.entries {
            self.index.insert(normalize(canon).text, canon.clone());
            for form in forms.values() {
                self.index.entry(normalize(form).text).or_insert_with(|| canon.clone());
            }
        }
    }

    /// Load a JSON or TOML table (by extension). Falls back to `default_seed()`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let parsed: Option<Self> = std::fs::read_to_string(path).ok().and_then(|s| {
            let is_toml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("toml"))
                .unwrap_or(false);
            if is_toml {
                toml::from_str(&s).ok()
            } else {
                serde_json::from_str(&s).ok()
            }
        });
        match parsed {
            Some(mut t) => {
                t.reindex();
                t
            }
            None => {
                tracing::warn!(target: "expansion", path = %path.display(), "proper-noun table unreadable, using built-in seed");
                Self::default_seed()
            }
        }
    }

    /// Pinned forms for a keyword given in any of its forms.
    pub fn lookup(&self, keyword: &str) -> Option<&BTreeMap<String, String>> {
        self.index
            .get(&normalize(keyword).text)
            .and_then(|canon| self.entries.get(canon))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Built-in seed with names that commonly get translated as common nouns.
    pub fn default_seed() -> Self {
        let mut entries = HashMap::new();
        for (canon, forms) in [
            ("Macron", [("ar", "ماكرون"), ("en", "Macron"), ("fr", "Macron")]),
            ("Sisi", [("ar", "السيسي"), ("en", "Sisi"), ("fr", "Sissi")]),
            ("Hamas", [("ar", "حماس"), ("en", "Hamas"), ("fr", "Hamas")]),
            ("Hezbollah", [("ar", "حزب الله"), ("en", "Hezbollah"), ("fr", "Hezbollah")]),
            ("Aramco", [("ar", "أرامكو"), ("en", "Aramco"), ("fr", "Aramco")]),
            ("Al Jazeera", [("ar", "الجزيرة"), ("en", "Al Jazeera"), ("fr", "Al Jazeera")]),
            ("Amal", [("ar", "أمل"), ("en", "Amal"), ("fr", "Amal")]),
            ("Nour", [("ar", "نور"), ("en", "Nour"), ("fr", "Nour")]),
        ] {
            entries.insert(
                canon.to_string(),
                forms
                    .iter()
                    .map(|(l, f)| (l.to_string(), f.to_string()))
                    .collect(),
            );
        }
        Self::from_entries(entries)
    }
}

// ------------------------------------------------------------
// Cache
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Target languages every keyword is expanded into.
    pub languages: Vec<String>,
    pub ttl_secs: u64,
    /// Background refresher period; 0 disables the refresher.
    pub refresh_interval_secs: u64,
    /// How long a cycle or job waits for keywords that were never expanded.
    pub warm_budget_ms: u64,
    /// Keywords refreshed at once during a warm pass.
    pub warm_concurrency: usize,
    pub proper_nouns_path: Option<String>,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            languages: vec!["ar".into(), "en".into(), "fr".into()],
            ttl_secs: 24 * 3600,
            refresh_interval_secs: 3600,
            warm_budget_ms: 2_000,
            warm_concurrency: 4,
            proper_nouns_path: None,
        }
    }
}

/// What one `warm` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub fresh: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Still being expanded by another task (or past the budget).
    pub pending: usize,
}

pub struct ExpansionCache {
    translator: DynTranslator,
    languages: Vec<String>,
    ttl: chrono::Duration,
    warm_budget: Duration,
    warm_concurrency: usize,
    proper_nouns: ProperNounTable,
    entries: RwLock<HashMap<String, KeywordExpansion>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases a keyword claimed for refresh, also when the task is dropped.
struct Claim<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.key);
    }
}

/// Enabled keywords merged by key; the first spelling wins and hint columns
/// are filled from whichever owner has them.
fn merge_keywords(keywords: &[Keyword]) -> BTreeMap<String, (String, KeywordTranslations)> {
    let mut merged: BTreeMap<String, (String, KeywordTranslations)> = BTreeMap::new();
    for k in keywords.iter().filter(|k| k.enabled && !k.text.trim().is_empty()) {
        let entry = merged
            .entry(keyword_key(&k.text))
            .or_insert_with(|| (k.text.trim().to_string(), KeywordTranslations::default()));
        let hints = &mut entry.1;
        if hints.ar.is_none() {
            hints.ar = k.translations.ar.clone();
        }
        if hints.en.is_none() {
            hints.en = k.translations.en.clone();
        }
        if hints.fr.is_none() {
            hints.fr = k.translations.fr.clone();
        }
    }
    merged
}

/// Cache and ownership key of a keyword text.
pub fn keyword_key(keyword: &str) -> String {
    normalize(keyword).text
}

impl ExpansionCache {
    pub fn new(translator: DynTranslator, cfg: &ExpansionConfig, proper_nouns: ProperNounTable) -> Self {
        let mut languages: Vec<String> = Vec::new();
        for l in &cfg.languages {
            let l = l.trim().to_ascii_lowercase();
            if !l.is_empty() && !languages.contains(&l) {
                languages.push(l);
            }
        }
        Self {
            translator,
            languages,
            ttl: config_secs(cfg.ttl_secs),
            warm_budget: Duration::from_millis(cfg.warm_budget_ms),
            warm_concurrency: cfg.warm_concurrency.max(1),
            proper_nouns,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached expansion, stale or not. Never translates.
    pub fn get(&self, keyword: &str) -> Option<KeywordExpansion> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(&keyword_key(keyword)).cloned()
    }

    pub fn insert(&self, expansion: KeywordExpansion) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.insert(keyword_key(&expansion.keyword), expansion);
    }

    fn claim(&self, key: &str) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(Claim {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }

    /// Translate `keyword` into every target language and store the result.
    ///
    /// A failed refresh does not overwrite a usable cached entry.
    pub async fn refresh(&self, keyword: &str, hints: &KeywordTranslations) -> KeywordExpansion {
        let expansion = self.build(keyword, hints).await;
        counter!("expansion_refresh_total", "status" => expansion.status.as_str()).increment(1);

        if expansion.status == ExpansionStatus::Failed {
            if let Some(old) = self.get(keyword).filter(|e| e.is_usable()) {
                tracing::warn!(target: "expansion", keyword, "refresh failed, keeping previous expansion");
                return old;
            }
        }
        self.insert(expansion.clone());
        expansion
    }

    async fn build(&self, keyword: &str, hints: &KeywordTranslations) -> KeywordExpansion {
        let keyword = keyword.trim();
        let own_lang = keyword_language(keyword);
        let mut variants: BTreeMap<String, String> = BTreeMap::new();

        let pinned = self.proper_nouns.lookup(keyword);
        let proper_noun = pinned.is_some();
        let hint_pairs = hints.pairs();

        let mut to_translate: Vec<&str> = Vec::new();
        for lang in &self.languages {
            if let Some(form) = pinned.and_then(|p| p.get(lang)) {
                variants.insert(lang.clone(), form.clone());
            } else if let Some((_, h)) = hint_pairs.iter().find(|(l, _)| *l == lang.as_str()) {
                variants.insert(lang.clone(), h.to_string());
            } else if *lang == own_lang {
                variants.insert(lang.clone(), keyword.to_string());
            } else {
                to_translate.push(lang.as_str());
            }
        }

        let results = join_all(
            to_translate
                .iter()
                .map(|lang| async move { (*lang, self.translator.translate(keyword, lang).await) }),
        )
        .await;

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut disabled = 0usize;
        for (lang, res) in results {
            match res {
                Ok(text) if !text.trim().is_empty() => {
                    variants.insert(lang.to_string(), text.trim().to_string());
                    succeeded += 1;
                }
                Ok(_) => failed += 1,
                Err(TranslateError::Disabled) => disabled += 1,
                Err(e) => {
                    tracing::debug!(target: "expansion", keyword, lang, error = %e, "translation failed");
                    failed += 1;
                }
            }
        }

        // Nothing translated and nothing known beyond the canonical text itself.
        let only_canonical = variants.values().all(|v| v == keyword);
        let status = if failed == 0 && disabled == 0 {
            ExpansionStatus::Complete
        } else if failed > 0 && succeeded == 0 && disabled == 0 && only_canonical && !proper_noun {
            variants.clear();
            ExpansionStatus::Failed
        } else {
            ExpansionStatus::Partial
        };

        if status != ExpansionStatus::Complete {
            tracing::warn!(
                target: "expansion",
                keyword,
                status = status.as_str(),
                failed,
                disabled,
                "keyword expansion incomplete"
            );
        }

        KeywordExpansion {
            keyword: keyword.to_string(),
            keyword_language: own_lang,
            variants,
            proper_noun,
            status,
            refreshed_at: Utc::now(),
        }
    }

    /// Pre-expand a keyword set: stale or missing entries get refreshed, fresh
    /// ones are left alone. Keywords sharing a text are expanded once with
    /// their hint columns merged. Up to `warm_concurrency` refreshes run at
    /// once; keywords another task is refreshing are counted as pending.
    pub async fn warm(&self, keywords: &[Keyword]) -> WarmReport {
        let now = Utc::now();
        let mut report = WarmReport::default();
        let mut due = Vec::new();
        for (key, (text, hints)) in merge_keywords(keywords) {
            if self.get(&text).is_some_and(|e| e.is_fresh(now, self.ttl)) {
                report.fresh += 1;
            } else {
                due.push((key, text, hints));
            }
        }

        let results: Vec<Option<bool>> = stream::iter(due)
            .map(|(key, text, hints)| async move {
                let _claim = self.claim(&key)?;
                Some(self.refresh(&text, &hints).await.is_usable())
            })
            .buffer_unordered(self.warm_concurrency)
            .collect()
            .await;
        for r in results {
            match r {
                Some(true) => report.refreshed += 1,
                Some(false) => report.failed += 1,
                None => report.pending += 1,
            }
        }

        tracing::info!(
            target: "expansion",
            fresh = report.fresh,
            refreshed = report.refreshed,
            failed = report.failed,
            pending = report.pending,
            cached = self.len(),
            "expansion cache warmed"
        );
        report
    }

    /// Warm without letting the translator hold up the caller.
    ///
    /// Stale but usable entries are refreshed on a detached task and used as
    /// they are meanwhile. Keywords with no usable entry are expanded on
    /// another detached task, waited for at most `warm_budget_ms`; whatever is
    /// not done by then lands in the cache later and is reported as pending.
    pub async fn warm_bounded(self: &Arc<Self>, keywords: &[Keyword]) -> WarmReport {
        let now = Utc::now();
        let mut stale = Vec::new();
        let mut missing = Vec::new();
        for k in keywords.iter().filter(|k| k.enabled) {
            match self.get(&k.text) {
                Some(e) if e.is_fresh(now, self.ttl) => {}
                Some(e) if e.is_usable() => stale.push(k.clone()),
                _ => missing.push(k.clone()),
            }
        }

        if !stale.is_empty() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.warm(&stale).await;
            });
        }
        if missing.is_empty() {
            return WarmReport::default();
        }

        let waiting = merge_keywords(&missing).len();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.warm(&missing).await });
        match tokio::time::timeout(self.warm_budget, task).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::warn!(target: "expansion", error = %e, "warm-up task ended abnormally");
                WarmReport {
                    failed: waiting,
                    ..WarmReport::default()
                }
            }
            Err(_) => {
                counter!("expansion_warm_timeouts_total").increment(1);
                tracing::warn!(
                    target: "expansion",
                    pending = waiting,
                    budget_ms = self.warm_budget.as_millis() as u64,
                    "new keywords still expanding, continuing without them"
                );
                WarmReport {
                    pending: waiting,
                    ..WarmReport::default()
                }
            }
        }
    }

    /// Warm the cache from the catalog now and then every `interval`, until
    /// `shutdown` flips to true. Catalog errors are logged and retried next tick.
    pub fn spawn_refresher(
        self: Arc<Self>,
        catalog: Arc<dyn CatalogStore>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match catalog.enabled_keywords().await {
                    Ok(keywords) => {
                        self.warm(&keywords).await;
                    }
                    Err(e) => {
                        tracing::warn!(target: "expansion", error = ?e, "loading keywords for refresh failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!(target: "expansion", "expansion refresher stopped");
        })
    }
}
