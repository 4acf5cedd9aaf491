use std::time::Duration;

use lk_dms_client::RetryPolicy as DmsRetryPolicy;
use lk_ledger_client::RetryPolicy as LedgerRetryPolicy;
use lk_llm::LlmConfig;
use lk_reconcile::ReconcileOptions;
use lk_review::Thresholds;
use serde::Deserialize;

use crate::error::PipelineError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DmsSection {
    pub base_url: String,
    pub token: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for DmsSection {
    fn default() -> Self {
        let retry = DmsRetryPolicy::default();
        Self {
            base_url: "http://localhost:8010".to_string(),
            token: String::new(),
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            connect_timeout_secs: retry.connect_timeout.as_secs(),
            read_timeout_secs: retry.read_timeout.as_secs(),
        }
    }
}

impl DmsSection {
    #[must_use]
    pub fn retry_policy(&self) -> DmsRetryPolicy {
        DmsRetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub base_url: String,
    pub token: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        let retry = LedgerRetryPolicy::default();
        Self {
            base_url: "http://localhost:8080".to_string(),
            token: String::new(),
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            connect_timeout_secs: retry.connect_timeout.as_secs(),
            read_timeout_secs: retry.read_timeout.as_secs(),
        }
    }
}

impl LedgerSection {
    #[must_use]
    pub fn retry_policy(&self) -> LedgerRetryPolicy {
        LedgerRetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

/// Mirrors `lk_llm::LlmConfig` with plain, TOML/env-friendly field types
/// (seconds as `u64` rather than `Duration`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub enabled: bool,
    pub ollama_url: String,
    pub model_fast: String,
    pub model_fallback: Option<String>,
    pub connect_timeout_secs: u64,
    pub timeout_seconds: u64,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub green_threshold: f32,
    pub calibration_count: i64,
    pub auth_header: Option<String>,
    pub cache_ttl_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        let defaults = LlmConfig::default();
        Self {
            enabled: defaults.enabled,
            ollama_url: defaults.ollama_url,
            model_fast: defaults.model_fast,
            model_fallback: defaults.model_fallback,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            timeout_seconds: defaults.timeout_seconds,
            max_concurrent: defaults.max_concurrent,
            max_retries: defaults.max_retries,
            green_threshold: defaults.green_threshold,
            calibration_count: defaults.calibration_count,
            auth_header: defaults.auth_header,
            cache_ttl_secs: defaults.cache_ttl.as_secs(),
        }
    }
}

impl LlmSection {
    #[must_use]
    pub fn to_llm_config(&self) -> LlmConfig {
        LlmConfig {
            enabled: self.enabled,
            ollama_url: self.ollama_url.clone(),
            model_fast: self.model_fast.clone(),
            model_fallback: self.model_fallback.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            timeout_seconds: self.timeout_seconds,
            max_concurrent: self.max_concurrent,
            max_retries: self.max_retries,
            green_threshold: self.green_threshold,
            calibration_count: self.calibration_count,
            auth_header: self.auth_header.clone(),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Empty means an in-memory database (used by tests and `--dry-run`
    /// style invocations); any other value is a file path.
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { path: String::new() }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub full_sync: bool,
    pub dry_run: bool,
    pub skip_sync: bool,
    pub date_tolerance_days: i64,
    pub auto_match_threshold: f32,
    pub max_results: usize,
    pub bank_first: bool,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        let defaults = ReconcileOptions::default();
        Self {
            full_sync: defaults.full_sync,
            dry_run: defaults.dry_run,
            skip_sync: defaults.skip_sync,
            date_tolerance_days: defaults.date_tolerance_days,
            auto_match_threshold: defaults.auto_match_threshold,
            max_results: defaults.max_results,
            bank_first: defaults.bank_first,
        }
    }
}

impl ReconcileSection {
    #[must_use]
    pub fn to_options(self) -> ReconcileOptions {
        ReconcileOptions {
            full_sync: self.full_sync,
            dry_run: self.dry_run,
            skip_sync: self.skip_sync,
            date_tolerance_days: self.date_tolerance_days,
            auto_match_threshold: self.auto_match_threshold,
            max_results: self.max_results,
            bank_first: self.bank_first,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    pub auto_overall: f32,
    pub auto_amount: f32,
    pub auto_date: f32,
    pub review_overall: f32,
}

impl Default for ReviewSection {
    fn default() -> Self {
        let defaults = Thresholds::default();
        Self {
            auto_overall: defaults.auto_overall,
            auto_amount: defaults.auto_amount,
            auto_date: defaults.auto_date,
            review_overall: defaults.review_overall,
        }
    }
}

impl ReviewSection {
    #[must_use]
    pub fn to_thresholds(self) -> Thresholds {
        Thresholds {
            auto_overall: self.auto_overall,
            auto_amount: self.auto_amount,
            auto_date: self.auto_date,
            review_overall: self.review_overall,
        }
    }
}

/// Top-level configuration, loaded by layering a TOML file (optional)
/// under environment variables: an upper-cased dotted-path key with a
/// single underscore as the section separator, e.g. `LLM_ENABLED=true`
/// or `LEDGER_TOKEN=...`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dms: DmsSection,
    pub ledger: LedgerSection,
    pub llm: LlmSection,
    pub store: StoreSection,
    pub reconcile: ReconcileSection,
    pub review: ReviewSection,
    /// Multi-tenant filter applied to every store call this process
    /// makes; `None` only ever sees legacy/shared rows.
    pub owner_user_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dms: DmsSection::default(),
            ledger: LedgerSection::default(),
            llm: LlmSection::default(),
            store: StoreSection::default(),
            reconcile: ReconcileSection::default(),
            review: ReviewSection::default(),
            owner_user_id: None,
        }
    }
}

impl Config {
    /// Loads configuration from an optional TOML file with environment
    /// variables layered on top: defaults, then file, then environment.
    /// Env vars are upper-cased dotted-path keys with a single
    /// underscore as the path separator, e.g. `LEDGER_TOKEN` overrides
    /// `ledger.token`, `LLM_ENABLED` overrides `llm.enabled`.
    pub fn load(path: Option<&str>) -> Result<Self, PipelineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::new().separator("_").try_parsing(true));
        let raw = builder
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        raw.try_deserialize()
            .map_err(|e| PipelineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_defaults() {
        let config = Config::default();
        assert_eq!(config.llm.ollama_url, LlmConfig::default().ollama_url);
        assert_eq!(config.reconcile.date_tolerance_days, ReconcileOptions::default().date_tolerance_days);
        assert_eq!(config.review.auto_overall, Thresholds::default().auto_overall);
        assert!(config.owner_user_id.is_none());
    }

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        let config = Config::load(None).expect("load defaults");
        assert_eq!(config.dms.base_url, DmsSection::default().base_url);
    }

    #[test]
    fn env_override_layers_over_defaults() {
        // SAFETY: test-only, no other thread in this process reads this var concurrently.
        unsafe {
            std::env::set_var("LLM_ENABLED", "true");
        }
        let config = Config::load(None).expect("load with env override");
        unsafe {
            std::env::remove_var("LLM_ENABLED");
        }
        assert!(config.llm.enabled);
    }
}
