// src/config/catalog.rs
//! Source/keyword catalog for standalone mode (TOML or JSON).
//!
//! ```toml
//! [[sources]]
//! id = 1
//! url = "https://feeds.reuters.com/world"
//! name = "Reuters"
//! country = "GB"
//!
//! [[keywords]]
//! id = 1
//! tenant_id = 42
//! text = "مصر"
//! translations = { en = "Egypt" }
//!
//! [subscriptions]
//! 42 = [1]
//! ```
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::store::MemoryStore;
use crate::types::{Keyword, Source, SourceId, TenantId};

pub const ENV_PATH: &str = "MONITOR_CATALOG_PATH";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub keywords: Vec<Keyword>,
    /// Tenant -> followed source ids. Keys are strings in TOML/JSON.
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Vec<SourceId>>,
}

impl Catalog {
    /// Parsed subscription map; entries with non-numeric tenant keys are dropped.
    pub fn tenant_subscriptions(&self) -> HashMap<TenantId, Vec<SourceId>> {
        self.subscriptions
            .iter()
            .filter_map(|(k, v)| k.trim().parse::<TenantId>().ok().map(|t| (t, v.clone())))
            .collect()
    }

    pub fn into_store(self) -> MemoryStore {
        let subs = self.tenant_subscriptions();
        let store = MemoryStore::with_catalog(self.sources, self.keywords);
        for (tenant, ids) in subs {
            store.subscribe(tenant, ids);
        }
        store
    }
}

/// Load a catalog from an explicit path. Supports TOML or JSON formats.
pub fn load_catalog_from(path: &Path) -> Result<Catalog> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading catalog from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_catalog(&content, ext.as_str())
}

/// Load the catalog using env var + fallbacks:
/// 1) $MONITOR_CATALOG_PATH
/// 2) config/catalog.toml
/// 3) config/catalog.json
///
/// No file at all yields an empty catalog.
pub fn load_catalog_default() -> Result<Catalog> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_catalog_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/catalog.toml");
    if toml_p.exists() {
        return load_catalog_from(&toml_p);
    }
    let json_p = PathBuf::from("config/catalog.json");
    if json_p.exists() {
        return load_catalog_from(&json_p);
    }
    Ok(Catalog::default())
}

fn parse_catalog(s: &str, hint_ext: &str) -> Result<Catalog> {
    let raw: Catalog = if hint_ext == "json" || s.trim_start().starts_with('{') {
        serde_json::from_str(s).context("parsing catalog JSON")?
    } else {
        toml::from_str(s).context("parsing catalog TOML")?
    };
    Ok(clean(raw))
}

/// Trim text fields, drop blank entries, dedup sources by id and URL and
/// keywords by (tenant, text).
fn clean(raw: Catalog) -> Catalog {
    let mut seen_ids = HashSet::new();
    let mut seen_urls = HashSet::new();
    let mut sources = Vec::new();
    for mut s in raw.sources {
        s.url = s.url.trim().to_string();
        s.name = s.name.trim().to_string();
        s.country = s.country.trim().to_ascii_uppercase();
        if s.url.is_empty() || !seen_ids.insert(s.id) || !seen_urls.insert(s.url.clone()) {
            continue;
        }
        if s.name.is_empty() {
            s.name = crate::ingest::host_of(&s.url);
        }
        sources.push(s);
    }

    let mut seen_kw = HashSet::new();
    let mut keywords = Vec::new();
    for mut k in raw.keywords {
        k.text = k.text.trim().to_string();
        if k.text.is_empty() || !seen_kw.insert((k.tenant_id, k.text.to_lowercase())) {
            continue;
        }
        keywords.push(k);
    }

    Catalog {
        sources,
        keywords,
        subscriptions: raw.subscriptions,
    }
}
