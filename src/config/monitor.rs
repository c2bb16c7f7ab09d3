// src/config/monitor.rs
use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::balancer::BalanceConfig;
use crate::expansion::ExpansionConfig;
use crate::health::HealthConfig;
use crate::ingest::FetcherConfig;
use crate::jobs::JobsConfig;
use crate::matching::context::ContextConfig;
use crate::scheduler::SchedulerConfig;
use crate::translate::TranslatorConfig;
use crate::types::MAX_CONFIG_SECS;

pub const ENV_PATH: &str = "MONITOR_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/monitor.toml";

fn default_display_language() -> String {
    "en".to_string()
}

/// Engine configuration. Every field has a default, so an empty file (or no
/// file) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub balancer: BalanceConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub translator: TranslatorConfig,
    /// Language tenants read titles, summaries and match context in.
    #[serde(default = "default_display_language")]
    pub display_language: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            fetcher: FetcherConfig::default(),
            expansion: ExpansionConfig::default(),
            context: ContextConfig::default(),
            balancer: BalanceConfig::default(),
            health: HealthConfig::default(),
            jobs: JobsConfig::default(),
            translator: TranslatorConfig::default(),
            display_language: default_display_language(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

impl MonitorConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading monitor config from {}", path.display()))?;
        let cfg: MonitorConfig = toml::from_str(&data)
            .with_context(|| format!("parsing monitor config {}", path.display()))?;
        Ok(cfg)
    }

    /// $MONITOR_CONFIG_PATH, else `config/monitor.toml`, else defaults; then
    /// env overrides and range clamping.
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            Self::load_from_file(&pb)?
        } else if Path::new(DEFAULT_PATH).exists() {
            Self::load_from_file(DEFAULT_PATH)?
        } else {
            Self::default()
        };
        cfg.apply_env();
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("MONITOR_INTERVAL_SECS") {
            self.scheduler.interval_secs = v;
        }
        if let Some(v) = env_parse("MONITOR_BATCH_SIZE") {
            self.scheduler.batch_size = v;
        }
        if let Some(v) = env_bool("MONITOR_RUN_ON_START") {
            self.scheduler.run_on_start = v;
        }
        if let Some(v) = env_bool("MONITOR_SCHEDULER_ENABLED") {
            self.scheduler.enabled = v;
        }
        if let Some(v) = env_parse("MONITOR_MAX_CONCURRENCY") {
            self.fetcher.max_concurrency = v;
        }
        if let Some(v) = env_parse("MONITOR_MAX_JOBS") {
            self.jobs.max_concurrent = v;
        }
        if let Some(v) = env_parse("MONITOR_QUOTA") {
            self.balancer.quota = v;
        }
        if let Ok(v) = env::var("MONITOR_DISPLAY_LANGUAGE") {
            if !v.trim().is_empty() {
                self.display_language = v.trim().to_ascii_lowercase();
            }
        }
        if let Ok(v) = env::var("TRANSLATE_PROVIDER") {
            self.translator.provider = v;
        }
        if let Ok(v) = env::var("TRANSLATE_ENDPOINT") {
            self.translator.endpoint = v;
        }
    }

    /// Clamp numeric knobs into workable ranges.
    pub fn sanitize(&mut self) {
        let s = &mut self.scheduler;
        s.interval_secs = s.interval_secs.clamp(30, 24 * 3600);
        s.batch_size = s.batch_size.clamp(1, 1_000);
        s.lease_stale_secs = s.lease_stale_secs.clamp(60, MAX_CONFIG_SECS);

        let f = &mut self.fetcher;
        f.max_concurrency = f.max_concurrency.clamp(1, 200);
        f.per_host_concurrency = f.per_host_concurrency.clamp(1, 20);
        f.max_retries = f.max_retries.min(10);
        f.backoff_max_ms = f.backoff_max_ms.max(f.backoff_base_ms);
        f.default_timeout_secs = f.default_timeout_secs.clamp(1, 300);
        f.fast_timeout_secs = f.fast_timeout_secs.clamp(1, 300);
        f.slow_timeout_secs = f.slow_timeout_secs.clamp(1, 300);

        self.balancer.quota = self.balancer.quota.max(1);
        self.jobs.max_concurrent = self.jobs.max_concurrent.clamp(1, 64);
        self.jobs.rate_limit_window_secs = self.jobs.rate_limit_window_secs.clamp(1, MAX_CONFIG_SECS);
        self.jobs.stale_job_secs = self.jobs.stale_job_secs.clamp(60, MAX_CONFIG_SECS);
        self.expansion.ttl_secs = self.expansion.ttl_secs.clamp(60, MAX_CONFIG_SECS);
        self.expansion.warm_budget_ms = self.expansion.warm_budget_ms.min(60_000);
        self.expansion.warm_concurrency = self.expansion.warm_concurrency.clamp(1, 32);
        self.health.max_tracked = self.health.max_tracked.max(1);

        if self.expansion.languages.is_empty() {
            self.expansion.languages = ExpansionConfig::default().languages;
        }
        if self.display_language.trim().is_empty() {
            self.display_language = default_display_language();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::GroupBy;
    use serial_test::serial;

    fn clear_env() {
        for k in [
            ENV_PATH,
            "MONITOR_INTERVAL_SECS",
            "MONITOR_BATCH_SIZE",
            "MONITOR_RUN_ON_START",
            "MONITOR_SCHEDULER_ENABLED",
            "MONITOR_MAX_CONCURRENCY",
            "MONITOR_MAX_JOBS",
            "MONITOR_QUOTA",
            "MONITOR_DISPLAY_LANGUAGE",
            "TRANSLATE_PROVIDER",
            "TRANSLATE_ENDPOINT",
        ] {
            env::remove_var(k);
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: MonitorConfig = toml::from_str(
            r#"
display_language = "fr"
[scheduler]
interval_secs = 600
[balancer]
strategy = "country"
[fetcher]
slow_domains = ["slow.test"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.display_language, "fr");
        assert_eq!(cfg.scheduler.interval_secs, 600);
        assert_eq!(cfg.scheduler.batch_size, SchedulerConfig::default().batch_size);
        assert_eq!(cfg.balancer.strategy, GroupBy::Country);
        assert_eq!(cfg.balancer.min_per_group, 2);
        assert_eq!(cfg.fetcher.slow_domains, vec!["slow.test".to_string()]);
        assert_eq!(cfg.fetcher.max_retries, FetcherConfig::default().max_retries);
    }

    #[test]
    fn sanitize_clamps() {
        let mut cfg = MonitorConfig::default();
        cfg.scheduler.interval_secs = 1;
        cfg.scheduler.batch_size = 0;
        cfg.fetcher.max_concurrency = 0;
        cfg.jobs.max_concurrent = 1_000;
        cfg.expansion.languages.clear();
        cfg.sanitize();
        assert_eq!(cfg.scheduler.interval_secs, 30);
        assert_eq!(cfg.scheduler.batch_size, 1);
        assert_eq!(cfg.fetcher.max_concurrency, 1);
        assert_eq!(cfg.jobs.max_concurrent, 64);
        assert_eq!(cfg.expansion.languages, vec!["ar", "en", "fr"]);
    }

    #[test]
    fn sanitize_caps_second_valued_settings() {
        let mut cfg = MonitorConfig::default();
        cfg.scheduler.lease_stale_secs = u64::MAX;
        cfg.jobs.stale_job_secs = u64::MAX;
        cfg.jobs.rate_limit_window_secs = u64::MAX;
        cfg.expansion.ttl_secs = u64::MAX;
        cfg.sanitize();
        assert_eq!(cfg.scheduler.lease_stale_secs, MAX_CONFIG_SECS);
        assert_eq!(cfg.jobs.stale_job_secs, MAX_CONFIG_SECS);
        assert_eq!(cfg.jobs.rate_limit_window_secs, MAX_CONFIG_SECS);
        assert_eq!(cfg.expansion.ttl_secs, MAX_CONFIG_SECS);
        // converting them no longer panics
        assert!(cfg.scheduler.lease_stale_after() > chrono::Duration::days(3000));
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("monitor.toml");
        fs::write(&p, "[scheduler]\ninterval_secs = 600\nbatch_size = 10\n").unwrap();
        env::set_var(ENV_PATH, p.display().to_string());
        env::set_var("MONITOR_INTERVAL_SECS", "120");
        env::set_var("MONITOR_RUN_ON_START", "yes");
        env::set_var("MONITOR_MAX_CONCURRENCY", "5000");

        let cfg = MonitorConfig::load().unwrap();
        assert_eq!(cfg.scheduler.interval_secs, 120);
        assert_eq!(cfg.scheduler.batch_size, 10);
        assert!(cfg.scheduler.run_on_start);
        assert_eq!(cfg.fetcher.max_concurrency, 200);
        clear_env();
    }

    #[test]
    #[serial]
    fn missing_explicit_path_is_an_error() {
        clear_env();
        env::set_var(ENV_PATH, "/definitely/not/here/monitor.toml");
        assert!(MonitorConfig::load().is_err());
        clear_env();
    }
}
