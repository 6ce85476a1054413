//! Configuration management for Lexforge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Legacy deployment variables (AZURE_SEARCH_ENDPOINT, DATABASE_URL, ...)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use crate::errors::{AppError, Result};
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard cap on cross-reference hops.
pub const MAX_REFERENCE_HOPS: usize = 3;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Relational reference store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Hosted semantic search index
    #[serde(default)]
    pub search: SearchConfig,

    /// Hosted generation service
    #[serde(default)]
    pub llm: LlmConfig,

    /// Answer pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout for non-streaming requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Search service endpoint, e.g. https://<service>.search.windows.net
    #[serde(default)]
    pub endpoint: String,

    /// Admin or query key
    #[serde(default)]
    pub api_key: String,

    /// Index holding the content chunks
    #[serde(default)]
    pub index_name: String,

    /// REST API version
    #[serde(default = "default_search_api_version")]
    pub api_version: String,

    /// Semantic ranker configuration name
    #[serde(default = "default_semantic_configuration")]
    pub semantic_configuration: String,

    /// Vector field the service embeds query text against
    #[serde(default = "default_vector_field")]
    pub vector_field: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Provider flavour: azure or openai
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Endpoint base URL
    #[serde(default)]
    pub api_base: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Deployment (azure) or model (openai) name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// API version (azure only)
    #[serde(default = "default_llm_api_version")]
    pub api_version: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Timeout for non-streaming calls in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Maximum number of expanded search queries
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,

    /// Results requested per search query
    #[serde(default = "default_search_top")]
    pub search_top: usize,

    /// Fall back to the last user utterance when query expansion fails
    #[serde(default = "default_enabled")]
    pub expansion_fallback: bool,

    /// Maximum cross-reference hops (clamped to MAX_REFERENCE_HOPS)
    #[serde(default = "default_reference_hops")]
    pub max_reference_hops: usize,

    /// Wall-clock budget for the whole reference lookup in milliseconds
    #[serde(default = "default_reference_timeout")]
    pub reference_timeout_ms: u64,

    /// Buffered stream events per response
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_enabled")]
    pub json_logging: bool,

    /// Expose /metrics
    #[serde(default = "default_enabled")]
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_database_url() -> String { "postgres://localhost/lexforge".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_search_api_version() -> String { "2024-07-01".to_string() }
fn default_semantic_configuration() -> String { "clic-semantic-config".to_string() }
fn default_vector_field() -> String { "embedding".to_string() }
fn default_search_timeout() -> u64 { 15 }
fn default_llm_provider() -> String { "azure".to_string() }
fn default_llm_model() -> String { "gpt-4.1-mini".to_string() }
fn default_llm_api_version() -> String { "2024-10-21".to_string() }
fn default_temperature() -> f32 { 0.3 }
fn default_llm_timeout() -> u64 { 60 }
fn default_max_queries() -> usize { 3 }
fn default_search_top() -> usize { 10 }
fn default_reference_hops() -> usize { MAX_REFERENCE_HOPS }
fn default_reference_timeout() -> u64 { 10_000 }
fn default_event_buffer() -> usize { 64 }
fn default_log_level() -> String { "info".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__SEARCH__INDEX_NAME=clic-index
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            );

        legacy_overrides(builder)?.build()?.try_deserialize()
    }

    /// Check that every collaborator endpoint is configured
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("database.url", &self.database.url),
            ("search.endpoint", &self.search.endpoint),
            ("search.api_key", &self.search.api_key),
            ("search.index_name", &self.search.index_name),
            ("llm.api_base", &self.llm.api_base),
        ];

        if let Some((key, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(AppError::Configuration {
                message: format!("{} is not defined", key),
            });
        }

        if !matches!(self.llm.provider.as_str(), "azure" | "openai") {
            return Err(AppError::Configuration {
                message: format!("unknown llm.provider '{}'", self.llm.provider),
            });
        }

        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl PipelineConfig {
    /// Reference lookup budget
    pub fn reference_timeout(&self) -> Duration {
        Duration::from_millis(self.reference_timeout_ms)
    }

    /// Configured hop limit, never above the hard cap
    pub fn reference_hop_cap(&self) -> usize {
        self.max_reference_hops.min(MAX_REFERENCE_HOPS)
    }
}

/// Environment names used by existing deployments, mapped onto config keys.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("AZURE_SEARCH_ENDPOINT", "search.endpoint"),
    ("AZURE_SEARCH_KEY", "search.api_key"),
    ("CLIC_INDEX_NAME", "search.index_name"),
    ("DATABASE_URL", "database.url"),
    ("AZURE_OPENAI_ENDPOINT", "llm.api_base"),
    ("AZURE_OPENAI_API_KEY", "llm.api_key"),
];

fn legacy_overrides(
    mut builder: ConfigBuilder<DefaultState>,
) -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
    for (var, key) in LEGACY_ENV {
        builder = builder.set_override_option(*key, std::env::var(var).ok())?;
    }
    Ok(builder)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queries: default_max_queries(),
            search_top: default_search_top(),
            expansion_fallback: default_enabled(),
            max_reference_hops: default_reference_hops(),
            reference_timeout_ms: default_reference_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_enabled(),
            metrics_enabled: default_enabled(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            index_name: String::new(),
            api_version: default_search_api_version(),
            semantic_configuration: default_semantic_configuration(),
            vector_field: default_vector_field(),
            timeout_secs: default_search_timeout(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_base: String::new(),
            api_key: String::new(),
            model: default_llm_model(),
            api_version: default_llm_api_version(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            search: SearchConfig::default(),
            llm: LlmConfig::default(),
            pipeline: PipelineConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> AppConfig {
        let mut config = AppConfig::default();
        config.search.endpoint = "https://clic.search.windows.net".to_string();
        config.search.api_key = "key".to_string();
        config.search.index_name = "clic-index".to_string();
        config.llm.api_base = "https://clic.openai.azure.com".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pipeline.max_queries, 3);
        assert_eq!(config.pipeline.search_top, 10);
        assert_eq!(config.pipeline.reference_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.search.vector_field, "embedding");
    }

    #[test]
    fn test_hop_cap_is_clamped() {
        let mut pipeline = PipelineConfig::default();
        pipeline.max_reference_hops = 9;
        assert_eq!(pipeline.reference_hop_cap(), MAX_REFERENCE_HOPS);

        pipeline.max_reference_hops = 1;
        assert_eq!(pipeline.reference_hop_cap(), 1);
    }

    #[test]
    fn test_validate_requires_search_endpoint() {
        let mut config = configured();
        assert!(config.validate().is_ok());

        config.search.endpoint = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("search.endpoint"));
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let mut config = configured();
        config.llm.provider = "bedrock".to_string();
        assert!(matches!(config.validate(), Err(AppError::Configuration { .. })));
    }
}
