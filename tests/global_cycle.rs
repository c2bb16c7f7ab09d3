// tests/global_cycle.rs
mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::*;
use feedwatch::expansion::{ExpansionStatus, KeywordExpansion};
use feedwatch::ingest::http::FixtureReply;
use feedwatch::pipeline::Pipeline;
use feedwatch::scheduler::{CycleOutcome, GlobalScheduler, SchedulerConfig, SchedulerState};
use feedwatch::store::{ArticleStore, CatalogStore, JobStore, MemoryStore};
use feedwatch::translate::StaticTranslator;
use feedwatch::types::{
    JobStatus, Keyword, KeywordTranslations, MonitorJob, Source, SourceId, TenantId, GLOBAL_TENANT,
};

fn egypt_store() -> MemoryStore {
    MemoryStore::with_catalog(
        fixture_sources(),
        vec![keyword(1, 1, "مصر"), keyword(2, 2, "مصر"), keyword(3, 3, "France")],
    )
}

fn scheduler(h: &Harness, holder: &str) -> Arc<GlobalScheduler> {
    Arc::new(GlobalScheduler::new(
        h.pipeline.clone(),
        h.store.clone(),
        SchedulerConfig::default(),
        holder,
    ))
}

fn completed(outcome: CycleOutcome) -> feedwatch::scheduler::CycleStats {
    match outcome {
        CycleOutcome::Completed(stats) => stats,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn egypt_fans_out_to_every_owning_tenant() {
    let h = harness(egypt_store(), fixture_transport());
    let s = scheduler(&h, "w:1");
    s.warm_expansions().await;

    let stats = completed(s.run_cycle().await);

    assert_eq!(stats.sources, 3);
    assert_eq!(stats.sources_failed, 0);
    assert_eq!(stats.keywords, 2);
    assert_eq!(stats.fetched, 5);
    // Reuters (Egypt), Al Jazeera (والمصر), Le Monde (Égypte)
    assert_eq!(stats.matched, 3);
    assert_eq!(stats.saved, 6);
    assert_eq!(stats.saved_per_tenant.get(&1), Some(&3));
    assert_eq!(stats.saved_per_tenant.get(&2), Some(&3));
    assert_eq!(stats.saved_per_tenant.get(&3), None);

    let rows = h.store.list_for_tenant(1, 10).await.unwrap();
    let reuters = rows
        .iter()
        .find(|a| a.url == "https://www.reuters.test/world/egypt-policy")
        .expect("reuters copy for tenant 1");
    assert_eq!(reuters.matched_keywords, vec!["مصر".to_string()]);
    assert_eq!(reuters.language, "en");
    assert_eq!(reuters.source_name, "Reuters");
    assert!(reuters.match_context.as_deref().unwrap_or_default().contains("**Egypt**"));
    assert!(reuters.title_translated.is_none());

    assert_eq!(h.store.count_for_tenant(2).await.unwrap(), 3);
    assert_eq!(h.store.count_for_tenant(3).await.unwrap(), 0);

    // The lease is closed.
    assert!(h.store.running_global().await.unwrap().is_none());
    let leases = h.store.list_jobs(GLOBAL_TENANT, 10).await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].status, JobStatus::Succeeded);
    assert_eq!(leases[0].progress.saved, 6);
}

#[tokio::test]
async fn second_cycle_only_finds_duplicates() {
    let h = harness(egypt_store(), fixture_transport());
    let s = scheduler(&h, "w:1");
    s.warm_expansions().await;

    completed(s.run_cycle().await);
    let again = completed(s.run_cycle().await);

    assert_eq!(again.matched, 3);
    assert_eq!(again.saved, 0);
    assert_eq!(again.duplicates, 6);
    assert_eq!(h.store.count_for_tenant(1).await.unwrap(), 3);
    assert_eq!(s.status().cycles_run, 2);
}

#[tokio::test]
async fn unchanged_feeds_are_downloaded_again_for_new_keywords() {
    let h = harness(egypt_store(), etag_transport());
    let s = scheduler(&h, "w:1");
    s.warm_expansions().await;

    let first = completed(s.run_cycle().await);
    assert_eq!(first.fetched, 5);
    assert_eq!(first.saved, 6);

    h.store.add_keyword(Keyword {
        translations: KeywordTranslations {
            ar: Some("القاهرة".into()),
            en: Some("Cairo".into()),
            fr: Some("Caire".into()),
        },
        ..keyword(10, 3, "Cairo")
    });
    s.warm_expansions().await;

    // the feeds still answer 304 to their ETags, but Cairo was never
    // searched for in them
    let second = completed(s.run_cycle().await);
    assert_eq!(second.fetched, 5);
    assert_eq!(second.saved_per_tenant.get(&3), Some(&2));
    assert_eq!(second.saved, 2);
    let rows = h.store.list_for_tenant(3, 10).await.unwrap();
    assert!(rows
        .iter()
        .all(|a| a.matched_keywords == vec!["Cairo".to_string()]));

    let third = completed(s.run_cycle().await);
    assert_eq!(third.fetched, 0);
    assert_eq!(third.sources_failed, 0);
    assert_eq!(h.transport.calls(REUTERS_URL), 3);
}

fn aged_egypt(days: i64) -> KeywordExpansion {
    let mut variants = BTreeMap::new();
    variants.insert("ar".to_string(), "مصر".to_string());
    variants.insert("en".to_string(), "Egypt".to_string());
    variants.insert("fr".to_string(), "Égypte".to_string());
    KeywordExpansion {
        keyword: "مصر".into(),
        keyword_language: "ar".into(),
        variants,
        proper_noun: false,
        status: ExpansionStatus::Complete,
        refreshed_at: Utc::now() - chrono::Duration::days(days),
    }
}

/// Stale Egypt expansion in the cache, France never expanded, and a translator
/// that takes 30 s per request.
fn stalled_translator_harness() -> Harness {
    let stalled = StaticTranslator::seeded().with_latency(Duration::from_secs(30));
    let h = harness_with(egypt_store(), fixture_transport(), stalled, "");
    h.pipeline.expansions.insert(aged_egypt(3));
    h
}

#[tokio::test(start_paused = true)]
async fn stalled_translator_does_not_hold_up_the_cycle() {
    let h = stalled_translator_harness();
    let s = scheduler(&h, "w:1");

    let started = tokio::time::Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        s.warm_expansions().await;
        s.run_cycle().await
    })
    .await
    .expect("cycle finishes while the translator is stalled");
    assert!(started.elapsed() < Duration::from_secs(3));

    let stats = completed(outcome);
    // France is still expanding and sits this cycle out
    assert_eq!(stats.keywords, 1);
    assert_eq!(stats.skipped_keywords, 1);
    assert_eq!(stats.saved, 6);

    // the stale entry is replaced once the translator answers
    tokio::time::sleep(Duration::from_secs(30)).await;
    let refreshed = h.pipeline.expansions.get("مصر").unwrap();
    assert!(refreshed.refreshed_at > aged_egypt(3).refreshed_at);
    assert!(h.pipeline.expansions.get("France").is_some());
}

#[tokio::test(start_paused = true)]
async fn loop_keeps_cycling_while_the_translator_stalls() {
    let h = stalled_translator_harness();
    let s = scheduler(&h, "w:1");

    assert!(s.start());
    s.trigger_now();
    for _ in 0..300 {
        if s.status().cycles_run > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let st = s.status();
    assert_eq!(st.cycles_run, 1);
    assert_eq!(st.last_stats.unwrap().saved, 6);
    assert!(s.stop());
}

#[tokio::test]
async fn keywords_without_expansion_are_skipped() {
    let h = harness(egypt_store(), fixture_transport());
    let s = scheduler(&h, "w:1");

    // no warm-up: the cycle itself never translates
    let stats = completed(s.run_cycle().await);
    assert_eq!(stats.keywords, 0);
    assert_eq!(stats.skipped_keywords, 2);
    assert_eq!(stats.fetched, 0);
    assert_eq!(h.translator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cycles_run_exactly_once() {
    let slow = fixture_transport().with_reply(
        REUTERS_URL,
        FixtureReply::Slow {
            body: reuters_xml().to_string(),
            delay: Duration::from_millis(200),
        },
    );
    let h = harness(egypt_store(), slow);
    let a = scheduler(&h, "a:1");
    let b = scheduler(&h, "b:2");
    a.warm_expansions().await;

    let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());

    let outcomes = [ra, rb];
    let done = outcomes.iter().filter(|o| matches!(o, CycleOutcome::Completed(_))).count();
    let skipped: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            CycleOutcome::Skipped { reason } => Some(reason.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(done, 1);
    assert_eq!(skipped, vec!["lock held"]);
    assert_eq!(h.store.count_for_tenant(1).await.unwrap(), 3);
    assert_eq!(a.status().cycles_skipped + b.status().cycles_skipped, 1);
}

fn running_lease(holder: &str, age: chrono::Duration) -> MonitorJob {
    let started = Utc::now() - age;
    let mut j = MonitorJob::queued(GLOBAL_TENANT, holder, started);
    j.status = JobStatus::Running;
    j.started_at = Some(started);
    j
}

#[tokio::test]
async fn live_lease_elsewhere_skips_the_cycle() {
    let h = harness(egypt_store(), fixture_transport());
    let other = running_lease("other:7", chrono::Duration::minutes(5));
    h.store.insert_job(&other).await.unwrap();

    let s = scheduler(&h, "w:1");
    assert_eq!(
        s.run_cycle().await,
        CycleOutcome::Skipped {
            reason: "lock held".into()
        }
    );
    assert_eq!(h.store.running_global().await.unwrap().unwrap().id, other.id);
    assert_eq!(s.status().cycles_skipped, 1);
    assert_eq!(s.status().cycles_run, 0);
}

#[tokio::test]
async fn stale_lease_is_force_expired() {
    let h = harness(egypt_store(), fixture_transport());
    let dead = running_lease("dead:1", chrono::Duration::hours(3));
    h.store.insert_job(&dead).await.unwrap();

    let s = scheduler(&h, "w:1");
    s.warm_expansions().await;
    completed(s.run_cycle().await);

    let old = h.store.get_job(dead.id).await.unwrap().unwrap();
    assert_eq!(old.status, JobStatus::Failed);
    assert!(old.error.unwrap().contains("lease expired"));
    assert!(h.store.running_global().await.unwrap().is_none());
}

/// Catalog whose source listing always fails.
struct NoSources(Arc<MemoryStore>);

#[async_trait]
impl CatalogStore for NoSources {
    async fn enabled_sources(&self) -> Result<Vec<Source>> {
        anyhow::bail!("catalog database unreachable")
    }
    async fn tenant_sources(&self, tenant: TenantId) -> Result<Vec<Source>> {
        self.0.tenant_sources(tenant).await
    }
    async fn enabled_keywords(&self) -> Result<Vec<Keyword>> {
        self.0.enabled_keywords().await
    }
    async fn tenant_keywords(&self, tenant: TenantId) -> Result<Vec<Keyword>> {
        self.0.tenant_keywords(tenant).await
    }
    async fn record_source_failures(&self, updates: &[(SourceId, u32)]) -> Result<()> {
        self.0.record_source_failures(updates).await
    }
}

#[tokio::test]
async fn failing_cycle_still_releases_the_lease() {
    let h = harness(egypt_store(), fixture_transport());
    let broken = Arc::new(Pipeline {
        fetcher: h.pipeline.fetcher.clone(),
        expansions: h.pipeline.expansions.clone(),
        health: h.pipeline.health.clone(),
        translator: h.pipeline.translator.clone(),
        catalog: Arc::new(NoSources(h.store.clone())),
        articles: h.pipeline.articles.clone(),
        context: h.pipeline.context.clone(),
        display_language: "en".into(),
    });
    let s = GlobalScheduler::new(broken, h.store.clone(), SchedulerConfig::default(), "w:1");
    s.warm_expansions().await;

    match s.run_cycle().await {
        CycleOutcome::Failed { error } => assert!(error.contains("catalog database unreachable"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }

    assert!(h.store.running_global().await.unwrap().is_none());
    let lease = &h.store.list_jobs(GLOBAL_TENANT, 1).await.unwrap()[0];
    assert_eq!(lease.status, JobStatus::Failed);
    assert!(lease.error.as_deref().unwrap().contains("loading enabled sources"));
    assert!(s.status().last_error.is_some());

    // the next cycle is not blocked
    let next = s.run_cycle().await;
    assert!(matches!(next, CycleOutcome::Failed { .. }));
}

#[tokio::test]
async fn start_trigger_stop() {
    let h = harness(egypt_store(), fixture_transport());
    let s = scheduler(&h, "w:1");

    assert_eq!(s.status().state, SchedulerState::Stopped);
    assert!(s.start());
    assert!(!s.start());
    assert_eq!(s.status().state, SchedulerState::Running);

    s.trigger_now();
    for _ in 0..200 {
        if s.status().cycles_run > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let st = s.status();
    assert_eq!(st.cycles_run, 1);
    assert!(st.last_run_at.is_some());
    // warmed by the loop before the cycle
    assert_eq!(st.last_stats.unwrap().saved, 6);

    assert!(s.stop());
    assert!(!s.stop());
    assert_eq!(s.status().state, SchedulerState::Stopped);
    assert!(s.status().next_run_at.is_none());
}
