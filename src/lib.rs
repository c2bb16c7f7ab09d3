// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod types;

// Feed fetching and parsing
pub mod ingest;

// Keyword expansion, matching, selection
pub mod balancer;
pub mod expansion;
pub mod matching;
pub mod translate;

// Persistence capabilities and feed health
pub mod health;
pub mod lease;
pub mod store;

// Orchestration
pub mod jobs;
pub mod pipeline;
pub mod scheduler;

pub mod config;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::expansion::{ExpansionCache, KeywordExpansion, ProperNounTable};
pub use crate::health::FeedHealthTracker;
pub use crate::ingest::{FeedFetcher, FetchStatus};
pub use crate::jobs::{JobError, JobExecutor};
pub use crate::matching::MatchingEngine;
pub use crate::pipeline::Pipeline;
pub use crate::scheduler::{CycleOutcome, GlobalScheduler};
pub use crate::store::{ArticleStore, CatalogStore, JobStore, MemoryStore};
pub use crate::translate::{TranslateError, Translator};
