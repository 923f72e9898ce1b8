//! Application configuration for docenrich.
//!
//! User config lives at `~/.docenrich/docenrich.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DocEnrichError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docenrich.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docenrich";

// ---------------------------------------------------------------------------
// Config structs (matching docenrich.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Batch pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Generation service settings.
    #[serde(default)]
    pub service: ServiceSection,

    /// Retry/backoff policy for service calls.
    #[serde(default)]
    pub retry: RetrySection,

    /// Fingerprint cache settings.
    #[serde(default)]
    pub cache: CacheSection,
}

/// What to do when the service answers with something that is not the
/// expected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Mark the record enriched with flagged placeholder values.
    #[default]
    Placeholder,
    /// Record a failure; the record stays eligible for the next run.
    Fail,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Number of concurrent enrichment workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Character budget for the text excerpt sent to the service.
    #[serde(default = "default_text_budget")]
    pub text_budget_chars: usize,

    /// Handling of malformed service responses.
    #[serde(default)]
    pub malformed_policy: MalformedPolicy,

    /// Also generate a short editorial title for enriched records.
    #[serde(default)]
    pub short_titles: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            text_budget_chars: default_text_budget(),
            malformed_policy: MalformedPolicy::default(),
            short_titles: false,
        }
    }
}

fn default_concurrency() -> usize {
    10
}
fn default_text_budget() -> usize {
    8_000
}

/// `[service]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Base URL of an OpenAI-compatible chat-completions API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Upper bound on generated tokens per request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_max_tokens() -> u32 {
    800
}
fn default_temperature() -> f64 {
    0.3
}
fn default_timeout_secs() -> u64 {
    60
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Total attempts per request, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled on each further retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on a single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Cap on the sum of all backoff delays for one request.
    #[serde(default = "default_max_total_wait_ms")]
    pub max_total_wait_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_total_wait_ms: default_max_total_wait_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_total_wait_ms() -> u64 {
    60_000
}

/// Cache storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// One JSON file per fingerprint under `dir`.
    #[default]
    Fs,
    /// Embedded libSQL database at `db_path`.
    Libsql,
    /// Process-local map; nothing survives the run.
    Memory,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Directory for the `fs` backend.
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Database file for the `libsql` backend.
    #[serde(default = "default_cache_db")]
    pub db_path: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            dir: default_cache_dir(),
            db_path: default_cache_db(),
        }
    }
}

fn default_cache_dir() -> String {
    "data/cache/llm_responses".into()
}
fn default_cache_db() -> String {
    "data/cache/llm_responses.db".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config file + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime settings for the generation service client.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: Url,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

impl ServiceConfig {
    /// Resolve the `[service]` section, reading the API key from the environment.
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        validate_api_key(config)?;
        let api_key = std::env::var(&config.service.api_key_env).unwrap_or_default();
        Self::with_api_key(config, api_key)
    }

    /// Resolve the `[service]` section with an explicit key.
    pub fn with_api_key(config: &AppConfig, api_key: impl Into<String>) -> Result<Self> {
        let section = &config.service;
        let base_url = Url::parse(&section.base_url).map_err(|e| {
            DocEnrichError::config(format!("invalid service.base_url '{}': {e}", section.base_url))
        })?;
        if !(0.0..=2.0).contains(&section.temperature) {
            return Err(DocEnrichError::config(format!(
                "service.temperature must be within 0.0..=2.0, got {}",
                section.temperature
            )));
        }
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            model: section.model.clone(),
            max_tokens: section.max_tokens,
            temperature: section.temperature,
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }
}

/// Runtime retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_total_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            max_total_wait: Duration::from_millis(section.max_total_wait_ms),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runtime pipeline options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub concurrency: usize,
    pub text_budget_chars: usize,
    pub malformed_policy: MalformedPolicy,
    pub short_titles: bool,
}

impl From<&AppConfig> for PipelineOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.pipeline.concurrency.max(1),
            text_budget_chars: config.pipeline.text_budget_chars,
            malformed_policy: config.pipeline.malformed_policy,
            short_titles: config.pipeline.short_titles,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docenrich/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocEnrichError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docenrich/docenrich.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocEnrichError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        DocEnrichError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocEnrichError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocEnrichError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocEnrichError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the service API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.service.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(DocEnrichError::config(format!(
            "service API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("text_budget_chars"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("malformed_policy = \"placeholder\""));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.concurrency, 10);
        assert_eq!(parsed.pipeline.text_budget_chars, 8_000);
        assert_eq!(parsed.retry.max_attempts, 3);
        assert_eq!(parsed.cache.backend, CacheBackend::Fs);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pipeline]
concurrency = 20
malformed_policy = "fail"

[cache]
backend = "libsql"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.concurrency, 20);
        assert_eq!(config.pipeline.malformed_policy, MalformedPolicy::Fail);
        assert_eq!(config.pipeline.text_budget_chars, 8_000);
        assert_eq!(config.service.model, "gpt-4o-mini");
        assert_eq!(config.cache.backend, CacheBackend::Libsql);
    }

    #[test]
    fn pipeline_options_from_app_config() {
        let mut app = AppConfig::default();
        app.pipeline.concurrency = 0;
        let options = PipelineOptions::from(&app);
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.malformed_policy, MalformedPolicy::Placeholder);
        assert!(!options.short_titles);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_total_wait: Duration::from_secs(10),
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn service_config_rejects_bad_url() {
        let mut app = AppConfig::default();
        app.service.base_url = "not a url".into();
        let err = ServiceConfig::with_api_key(&app, "k").unwrap_err();
        assert!(err.to_string().contains("service.base_url"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.service.api_key_env = "DOCENRICH_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
