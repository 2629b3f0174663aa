//! Application configuration for Leadflow.
//!
//! User config lives at `~/.leadflow/leadflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};
use crate::types::{Field, MergePolicy};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadflow";

// ---------------------------------------------------------------------------
// Config structs (matching leadflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Provider response cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Structured source providers.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Enrichment chain.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// OpenRouter settings (text service).
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Summarization and signal detection.
    #[serde(default)]
    pub insights: InsightsConfig,

    /// Lead scoring.
    #[serde(default)]
    pub scoring: ScoringConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Number of identifiers processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// libSQL database for cache entries and finalized records.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            db_path: default_db_path(),
        }
    }
}

fn default_concurrency() -> u32 {
    4
}
fn default_db_path() -> String {
    "~/.leadflow/leadflow.db".into()
}

/// Where provider responses are cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Process-local map, lost on exit.
    #[default]
    Memory,
    /// Persistent libSQL table next to the record store.
    Libsql,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Lifetime of a cached provider response.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

/// Connection details for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Base URL of the provider API.
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderEndpoint {
    fn new(base_url: &str, api_key_env: &str) -> Self {
        Self {
            base_url: base_url.into(),
            api_key_env: Some(api_key_env.into()),
        }
    }

    /// Resolve the API key from the environment, if one is configured and set.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

/// `[sources]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Source providers queried for every identifier, in precedence order.
    #[serde(default = "default_source_order")]
    pub order: Vec<String>,

    /// Per-call timeout for provider fetches.
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,

    /// Endpoints keyed by provider id.
    #[serde(default = "default_endpoints")]
    pub providers: BTreeMap<String, ProviderEndpoint>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            order: default_source_order(),
            timeout_secs: default_source_timeout(),
            providers: default_endpoints(),
        }
    }
}

fn default_source_order() -> Vec<String> {
    ["crunchbase", "angellist", "kaspr", "googlemaps"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_source_timeout() -> u64 {
    10
}
fn default_endpoints() -> BTreeMap<String, ProviderEndpoint> {
    BTreeMap::from([
        (
            "crunchbase".to_string(),
            ProviderEndpoint::new("https://api.crunchbase.com/api/v4", "CRUNCHBASE_API_KEY"),
        ),
        (
            "angellist".to_string(),
            ProviderEndpoint::new("https://api.angel.co/1", "ANGELLIST_API_KEY"),
        ),
        (
            "kaspr".to_string(),
            ProviderEndpoint::new("https://api.developers.kaspr.io", "KASPR_API_KEY"),
        ),
        (
            "googlemaps".to_string(),
            ProviderEndpoint::new(
                "https://maps.googleapis.com/maps/api/place",
                "GOOGLE_MAPS_API_KEY",
            ),
        ),
        (
            "apollo".to_string(),
            ProviderEndpoint::new("https://api.apollo.io/api/v1", "APOLLO_ENRICHMENT_API_KEY"),
        ),
    ])
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Enrichment providers, primary first.
    #[serde(default = "default_enrichment_providers")]
    pub providers: Vec<String>,

    /// Fields the chain tries to fill; it stops once all are set.
    #[serde(default = "default_target_fields")]
    pub target_fields: Vec<Field>,

    #[serde(default)]
    pub merge_policy: MergePolicy,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            providers: default_enrichment_providers(),
            target_fields: default_target_fields(),
            merge_policy: MergePolicy::default(),
        }
    }
}

fn default_enrichment_providers() -> Vec<String> {
    vec!["apollo".into(), "kaspr".into()]
}
fn default_target_fields() -> Vec<Field> {
    vec![
        Field::Funding,
        Field::TechStack,
        Field::EmployeeCount,
        Field::Domain,
        Field::Industry,
        Field::Website,
        Field::Description,
    ]
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for summaries and signal detection.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// OpenAI-compatible API root.
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[insights]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsConfig {
    /// Run the summarization stage.
    #[serde(default = "default_true")]
    pub summarize: bool,

    /// Run the signal detection stage.
    #[serde(default = "default_true")]
    pub detect_signals: bool,

    /// Deadline for one insight call, retries included.
    #[serde(default = "default_insight_timeout")]
    pub timeout_secs: u64,

    /// Retries after a rate-limit response. Other errors are never retried.
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    /// Pause before a rate-limit retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,

    #[serde(default = "default_signals_max_tokens")]
    pub signals_max_tokens: u32,

    /// Lifetime of cached model answers; 0 disables the insight cache.
    #[serde(default = "default_insight_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            summarize: true,
            detect_signals: true,
            timeout_secs: default_insight_timeout(),
            rate_limit_retries: default_rate_limit_retries(),
            retry_backoff_ms: default_retry_backoff(),
            summary_max_tokens: default_summary_max_tokens(),
            signals_max_tokens: default_signals_max_tokens(),
            cache_ttl_secs: default_insight_cache_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_insight_timeout() -> u64 {
    20
}
fn default_rate_limit_retries() -> u32 {
    1
}
fn default_retry_backoff() -> u64 {
    500
}
fn default_summary_max_tokens() -> u32 {
    80
}
fn default_signals_max_tokens() -> u32 {
    300
}
fn default_insight_cache_ttl() -> u64 {
    86_400
}

/// `[scoring]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Strategy name: "rule-based" or "ml-based".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Weight overrides keyed by rule name. Unknown keys are ignored.
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            weights: BTreeMap::new(),
        }
    }
}

fn default_strategy() -> String {
    "rule-based".into()
}

// ---------------------------------------------------------------------------
// Pipeline settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline settings, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum identifiers in flight.
    pub concurrency: usize,
    /// TTL applied to freshly fetched provider payloads.
    pub cache_ttl: Duration,
    /// Per-call deadline for source and enrichment fetches.
    pub source_timeout: Duration,
    /// Fields the enrichment chain tries to fill.
    pub target_fields: Vec<Field>,
    pub merge_policy: MergePolicy,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.defaults.concurrency.max(1) as usize,
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            source_timeout: Duration::from_secs(config.sources.timeout_secs),
            target_fields: config.enrichment.target_fields.clone(),
            merge_policy: config.enrichment.merge_policy,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LeadflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadflow/leadflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| LeadflowError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
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
    let content = std::fs::read_to_string(path).map_err(|e| LeadflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LeadflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LeadflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LeadflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LeadflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(LeadflowError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
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
        assert!(toml_str.contains("ttl_secs"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("APOLLO_ENRICHMENT_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.cache.ttl_secs, 3600);
        assert_eq!(parsed.sources.order.len(), 4);
        assert_eq!(parsed.enrichment.merge_policy, MergePolicy::FirstWins);
        assert_eq!(parsed.insights.rate_limit_retries, 1);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[cache]
backend = "libsql"

[enrichment]
providers = ["apollo"]
target_fields = ["funding", "employee_count"]
merge_policy = "higher_precedence_overrides"

[scoring.weights]
"signal.funding" = 40.0
bogus_rule = 3.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.cache.backend, CacheBackend::Libsql);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(
            config.enrichment.target_fields,
            vec![Field::Funding, Field::EmployeeCount]
        );
        assert_eq!(
            config.enrichment.merge_policy,
            MergePolicy::HigherPrecedenceOverrides
        );
        assert_eq!(config.scoring.weights.get("signal.funding"), Some(&40.0));
        assert_eq!(config.scoring.strategy, "rule-based");
        assert!(config.sources.providers.contains_key("apollo"));
    }

    #[test]
    fn pipeline_settings_from_app_config() {
        let mut app = AppConfig::default();
        app.defaults.concurrency = 0;
        let settings = PipelineSettings::from(&app);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.cache_ttl, Duration::from_secs(3600));
        assert_eq!(settings.source_timeout, Duration::from_secs(10));
        assert!(settings.target_fields.contains(&Field::Funding));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home("/tmp/leadflow.db").unwrap(),
            PathBuf::from("/tmp/leadflow.db")
        );
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "LF_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
