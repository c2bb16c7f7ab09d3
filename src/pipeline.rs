// src/pipeline.rs
//! Fetch → match → persist steps shared by the global scheduler and tenant jobs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;

use crate::expansion::{keyword_key, ExpansionCache, KeywordExpansion};
use crate::health::FeedHealthTracker;
use crate::ingest::{FeedFetcher, FetchBatch, FetchMode};
use crate::matching::context::{context_for_display, ContextConfig};
use crate::matching::MatchingEngine;
use crate::store::{ArticleStore, CatalogStore};
use crate::translate::DynTranslator;
use crate::types::{Keyword, MatchRecord, PersistedArticle, SaveOutcome, Source, TenantId};

/// Cooperative cancellation signal, checked between phases.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keyword key -> tenant -> that tenant's own spelling of the keyword.
pub type KeywordOwners = HashMap<String, BTreeMap<TenantId, String>>;

/// Group enabled keywords by normalized text.
pub fn keyword_owners(keywords: &[Keyword]) -> KeywordOwners {
    let mut owners: KeywordOwners = HashMap::new();
    for k in keywords.iter().filter(|k| k.enabled && !k.text.trim().is_empty()) {
        owners
            .entry(keyword_key(&k.text))
            .or_default()
            .entry(k.tenant_id)
            .or_insert_with(|| k.text.trim().to_string());
    }
    owners
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMatchStats {
    pub sources: usize,
    pub sources_failed: usize,
    pub articles_fetched: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub saved: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub saved_per_tenant: BTreeMap<TenantId, usize>,
}

impl PersistStats {
    pub fn merge(&mut self, other: PersistStats) {
        self.saved += other.saved;
        self.duplicates += other.duplicates;
        self.errors += other.errors;
        for (t, n) in other.saved_per_tenant {
            *self.saved_per_tenant.entry(t).or_default() += n;
        }
    }
}

/// Per-match data computed once and shared by every tenant copy.
#[derive(Debug, Clone)]
pub struct PreparedArticle {
    pub record: MatchRecord,
    pub title_translated: Option<String>,
    pub summary_translated: Option<String>,
    /// Keyword key -> rendered context of its earliest hit.
    pub contexts: HashMap<String, String>,
}

pub struct Pipeline {
    pub fetcher: Arc<FeedFetcher>,
    pub expansions: Arc<ExpansionCache>,
    pub health: Arc<FeedHealthTracker>,
    pub translator: DynTranslator,
    pub catalog: Arc<dyn CatalogStore>,
    pub articles: Arc<dyn ArticleStore>,
    pub context: ContextConfig,
    pub display_language: String,
}

impl Pipeline {
    /// Cached expansions for the given keyword keys. Read-only: missing or
    /// failed entries are skipped with a warning.
    pub fn load_expansions<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> Vec<KeywordExpansion> {
        let mut out = Vec::new();
        for key in keys {
            match self.expansions.get(key) {
                Some(e) if e.is_usable() => out.push(e),
                Some(_) => {
                    tracing::warn!(target: "pipeline", keyword = %key, "expansion failed, keyword skipped this run");
                }
                None => {
                    tracing::warn!(target: "pipeline", keyword = %key, "no cached expansion, keyword skipped this run");
                }
            }
        }
        out
    }

    /// Fetch one batch of sources and feed the outcomes to the health tracker.
    pub async fn fetch(&self, sources: &[Source], mode: FetchMode) -> FetchBatch {
        let batch = self.fetcher.fetch_all_with(sources, mode).await;
        self.health.record_batch(&batch.outcomes);
        self.health
            .write_back_failures(self.catalog.as_ref(), &batch.outcomes)
            .await;
        batch
    }

    /// Fetch and match `sources` in batches of `batch_size`; only matches
    /// survive a batch.
    pub async fn fetch_and_match(
        &self,
        sources: &[Source],
        engine: &MatchingEngine,
        batch_size: usize,
        mode: FetchMode,
    ) -> (Vec<MatchRecord>, FetchMatchStats) {
        let mut stats = FetchMatchStats {
            sources: sources.len(),
            ..FetchMatchStats::default()
        };
        let mut matches = Vec::new();
        for chunk in sources.chunks(batch_size.max(1)) {
            let batch = self.fetch(chunk, mode).await;
            stats.batches += 1;
            stats.articles_fetched += batch.articles.len();
            stats.sources_failed += batch
                .outcomes
                .iter()
                .filter(|o| o.status.is_failure())
                .count();
            let FetchBatch { outcomes, articles } = batch;
            drop(outcomes);
            matches.extend(engine.match_articles(articles));
            tracing::debug!(
                target: "pipeline",
                batch = stats.batches,
                fetched = stats.articles_fetched,
                matched = matches.len(),
                "batch done"
            );
        }
        (matches, stats)
    }

    /// Rendered context of each keyword's earliest hit, keyed by keyword key.
    async fn contexts_for(&self, record: &MatchRecord) -> HashMap<String, String> {
        let text = record.article.searchable_text();
        let mut contexts = HashMap::new();
        for m in &record.matches {
            let Some(hit) = m.primary() else {
                continue;
            };
            if let Some(ctx) = context_for_display(
                &text,
                hit,
                &self.context,
                self.translator.as_ref(),
                &record.language,
                &self.display_language,
            )
            .await
            {
                contexts.insert(keyword_key(&m.keyword), ctx);
            }
        }
        contexts
    }

    /// Title/summary translation and match context, once per match.
    pub async fn prepare(&self, record: MatchRecord) -> PreparedArticle {
        let needs_translation =
            !self.display_language.is_empty() && record.language != self.display_language;

        let mut title_translated = None;
        let mut summary_translated = None;
        if needs_translation {
            if !record.article.title.is_empty() {
                match self.translator.translate(&record.article.title, &self.display_language).await {
                    Ok(t) => title_translated = Some(t),
                    Err(e) => tracing::debug!(target: "pipeline", error = %e, "title translation failed"),
                }
            }
            if !record.article.summary.is_empty() {
                match self.translator.translate(&record.article.summary, &self.display_language).await {
                    Ok(t) => summary_translated = Some(t),
                    Err(e) => tracing::debug!(target: "pipeline", error = %e, "summary translation failed"),
                }
            }
        }

        let contexts = self.contexts_for(&record).await;
        PreparedArticle {
            record,
            title_translated,
            summary_translated,
            contexts,
        }
    }

    /// Store one copy per owning tenant, each listing only that tenant's
    /// keywords. Tenants that already have the URL are skipped.
    pub async fn persist_for_tenants(&self, prepared: &PreparedArticle, owners: &KeywordOwners) -> PersistStats {
        let mut per_tenant: BTreeMap<TenantId, (Vec<String>, Option<String>)> = BTreeMap::new();
        for m in &prepared.record.matches {
            let key = keyword_key(&m.keyword);
            let Some(tenants) = owners.get(&key) else {
                continue;
            };
            for (tenant, text) in tenants {
                let slot = per_tenant.entry(*tenant).or_default();
                if !slot.0.contains(text) {
                    slot.0.push(text.clone());
                }
                if slot.1.is_none() {
                    slot.1 = prepared.contexts.get(&key).cloned();
                }
            }
        }

        let a = &prepared.record.article;
        let mut stats = PersistStats::default();
        for (tenant, (keywords, context)) in per_tenant {
            match self.articles.exists(tenant, &a.link).await {
                Ok(true) => {
                    stats.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(target: "pipeline", tenant, url = %a.link, error = ?e, "existence check failed");
                    stats.errors += 1;
                    continue;
                }
            }
            let row = PersistedArticle {
                tenant_id: tenant,
                url: a.link.clone(),
                title: a.title.clone(),
                summary: a.summary.clone(),
                title_translated: prepared.title_translated.clone(),
                summary_translated: prepared.summary_translated.clone(),
                source_id: a.source_id,
                source_name: a.source_name.clone(),
                country: a.country.clone(),
                language: prepared.record.language.clone(),
                published_at: a.published_at,
                image_url: a.image_url.clone(),
                matched_keywords: keywords,
                match_context: context,
                created_at: Utc::now(),
            };
            match self.articles.create(row).await {
                Ok(SaveOutcome::Inserted) => {
                    stats.saved += 1;
                    *stats.saved_per_tenant.entry(tenant).or_default() += 1;
                }
                Ok(SaveOutcome::Duplicate) => stats.duplicates += 1,
                Err(e) => {
                    tracing::warn!(target: "pipeline", tenant, url = %a.link, error = ?e, "saving article failed");
                    stats.errors += 1;
                }
            }
        }
        counter!("articles_saved_total").increment(stats.saved as u64);
        counter!("articles_duplicate_total").increment(stats.duplicates as u64);
        stats
    }

    /// Fold keyword matches of another copy of the same link into `prepared`.
    /// Contexts of the new keywords come from the copy's own text.
    async fn absorb(&self, prepared: &mut PreparedArticle, mut other: MatchRecord) {
        let known: HashSet<String> = prepared.record.keywords().map(keyword_key).collect();
        other.matches.retain(|m| !known.contains(&keyword_key(&m.keyword)));
        if other.matches.is_empty() {
            return;
        }
        for (key, ctx) in self.contexts_for(&other).await {
            prepared.contexts.entry(key).or_insert(ctx);
        }
        prepared.record.matches.append(&mut other.matches);
    }

    /// Prepare and persist every match. Records sharing a link (one article
    /// reached through several feeds) are stored once with their keywords merged.
    pub async fn persist_all(&self, matches: Vec<MatchRecord>, owners: &KeywordOwners) -> PersistStats {
        let mut stats = PersistStats::default();
        for group in group_by_link(matches) {
            let mut copies = group.into_iter();
            let Some(first) = copies.next() else {
                continue;
            };
            let mut prepared = self.prepare(first).await;
            for other in copies {
                self.absorb(&mut prepared, other).await;
            }
            stats.merge(self.persist_for_tenants(&prepared, owners).await);
        }
        stats
    }
}

/// Records grouped by link, groups and members in first-seen order.
fn group_by_link(matches: Vec<MatchRecord>) -> Vec<Vec<MatchRecord>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<MatchRecord>> = Vec::new();
    for record in matches {
        match index.get(&record.article.link) {
            Some(&i) => groups[i].push(record),
            None => {
                index.insert(record.article.link.clone(), groups.len());
                groups.push(vec![record]);
            }
        }
    }
    groups
}
