// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::Arc;

use feedwatch::expansion::{ExpansionCache, ExpansionConfig, ProperNounTable};
use feedwatch::health::{FeedHealthTracker, HealthConfig};
use feedwatch::ingest::http::FixtureTransport;
use feedwatch::ingest::{FeedFetcher, FetcherConfig};
use feedwatch::matching::context::ContextConfig;
use feedwatch::pipeline::Pipeline;
use feedwatch::store::MemoryStore;
use feedwatch::translate::{DynTranslator, StaticTranslator};
use feedwatch::types::{Keyword, KeywordTranslations, Source, SourceId, TenantId};

pub const REUTERS_URL: &str = "https://www.reuters.test/world/rss";
pub const ALJAZEERA_URL: &str = "https://www.aljazeera.test/rss";
pub const LEMONDE_URL: &str = "https://www.lemonde.test/international/atom";

pub fn reuters_xml() -> &'static str {
    include_str!("../fixtures/reuters_world.xml")
}

pub fn aljazeera_xml() -> &'static str {
    include_str!("../fixtures/aljazeera_ar.xml")
}

pub fn lemonde_xml() -> &'static str {
    include_str!("../fixtures/lemonde_atom.xml")
}

pub fn source(id: SourceId, url: &str, name: &str, country: &str) -> Source {
    Source {
        id,
        url: url.into(),
        name: name.into(),
        country: country.into(),
        enabled: true,
        consecutive_failures: 0,
    }
}

pub fn keyword(id: i64, tenant: TenantId, text: &str) -> Keyword {
    Keyword {
        id,
        tenant_id: tenant,
        text: text.into(),
        translations: KeywordTranslations::default(),
        enabled: true,
    }
}

/// Three fixture feeds: Reuters (GB), Al Jazeera (QA), Le Monde (FR).
pub fn fixture_transport() -> FixtureTransport {
    FixtureTransport::new()
        .with_body(REUTERS_URL, reuters_xml())
        .with_body(ALJAZEERA_URL, aljazeera_xml())
        .with_body(LEMONDE_URL, lemonde_xml())
}

/// The same feeds, each answering 304 to its own ETag.
pub fn etag_transport() -> FixtureTransport {
    FixtureTransport::new()
        .with_etag(REUTERS_URL, reuters_xml(), "\"r1\"")
        .with_etag(ALJAZEERA_URL, aljazeera_xml(), "\"a1\"")
        .with_etag(LEMONDE_URL, lemonde_xml(), "\"l1\"")
}

pub fn fixture_sources() -> Vec<Source> {
    vec![
        source(1, REUTERS_URL, "Reuters", "GB"),
        source(2, ALJAZEERA_URL, "Al Jazeera", "QA"),
        source(3, LEMONDE_URL, "Le Monde", "FR"),
    ]
}

/// Fetcher settings that keep failing tests fast.
pub fn quick_fetcher_config() -> FetcherConfig {
    FetcherConfig {
        max_retries: 1,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        ..FetcherConfig::default()
    }
}

pub fn memory_health() -> Arc<FeedHealthTracker> {
    Arc::new(FeedHealthTracker::new(HealthConfig {
        state_path: None,
        ..HealthConfig::default()
    }))
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<FixtureTransport>,
    pub translator: Arc<StaticTranslator>,
    pub pipeline: Arc<Pipeline>,
}

/// Pipeline over `store`, a fixture transport and the seeded static
/// translator. Expansions start empty.
pub fn harness(store: MemoryStore, transport: FixtureTransport) -> Harness {
    harness_with(store, transport, StaticTranslator::seeded(), "en")
}

/// Like `harness`, with a chosen translator and display language ("" stores
/// articles untranslated).
pub fn harness_with(
    store: MemoryStore,
    transport: FixtureTransport,
    translator: StaticTranslator,
    display_language: &str,
) -> Harness {
    let store = Arc::new(store);
    let transport = Arc::new(transport);
    let translator = Arc::new(translator);
    let dyn_translator: DynTranslator = translator.clone();
    let expansions = Arc::new(ExpansionCache::new(
        dyn_translator.clone(),
        &ExpansionConfig::default(),
        ProperNounTable::default_seed(),
    ));
    let pipeline = Arc::new(Pipeline {
        fetcher: Arc::new(FeedFetcher::new(transport.clone(), quick_fetcher_config())),
        expansions,
        health: memory_health(),
        translator: dyn_translator,
        catalog: store.clone(),
        articles: store.clone(),
        context: ContextConfig::default(),
        display_language: display_language.into(),
    });
    Harness {
        store,
        transport,
        translator,
        pipeline,
    }
}
