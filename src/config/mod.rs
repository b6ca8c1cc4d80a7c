//! Configuration management for the vector store access layer

use serde::{Deserialize, Serialize};
use secrecy::{ExposeSecret, Secret};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod loader;
pub mod validation;

/// Hosts that never trigger the insecure-remote warning
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]", "0.0.0.0"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub index_metadata: IndexMetadataSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote vector database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `http` or `https`
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Full URL override; wins over protocol/host/port when set
    #[serde(default)]
    pub url: Option<String>,

    /// Auth token (optional, secured)
    #[serde(default, serialize_with = "serialize_optional_secret", deserialize_with = "deserialize_optional_secret")]
    pub auth_token: Option<Secret<String>>,

    #[serde(default = "default_tenant")]
    pub tenant: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_files_collection")]
    pub files_collection: String,

    #[serde(default = "default_folders_collection")]
    pub folders_collection: String,
}

/// Per-call time limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Single network call; batch calls get twice this
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_ms: u64,

    /// Whole initialization attempt
    #[serde(default = "default_init_timeout_ms")]
    pub init_ms: u64,
}

/// Transient-failure retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    /// Time spent OPEN before a trial call is allowed
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Upper bound for a single guarded call
    #[serde(default = "default_operation_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

/// Offline queue sizing and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,

    /// Pause between flush batches
    #[serde(default = "default_queue_batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Queue file; `None` keeps the queue in memory only
    #[serde(default)]
    pub persist_path: Option<PathBuf>,

    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

/// Query cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    /// Proactive expiry sweep; 0 disables it
    #[serde(default = "default_cache_sweep_ms")]
    pub sweep_interval_ms: u64,
}

/// Health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Periodic check interval; 0 disables the background monitor
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Per-endpoint timeout for HTTP heartbeat races
    #[serde(default = "default_http_probe_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Timeout of one full check
    #[serde(default = "default_health_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

/// Read path limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

/// Embedding index metadata file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadataSettings {
    /// Where to write `{model, dims, updatedAt}`; `None` disables it
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

/// Destructive recovery policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoverySettings {
    /// Recreate collections when corruption is suspected. Off unless the
    /// operator opts in: a reset deletes every stored embedding.
    #[serde(default)]
    pub auto_reset_on_corruption: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` or anything else for plain text
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_protocol() -> String { "http".to_string() }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8000 }
fn default_tenant() -> String { "default_tenant".to_string() }
fn default_database() -> String { "default_database".to_string() }
fn default_files_collection() -> String { "file_embeddings".to_string() }
fn default_folders_collection() -> String { "folder_embeddings".to_string() }
fn default_operation_timeout_ms() -> u64 { 30_000 }
fn default_init_timeout_ms() -> u64 { 15_000 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 100 }
fn default_retry_max_delay_ms() -> u64 { 5_000 }
fn default_failure_threshold() -> usize { 5 }
fn default_success_threshold() -> usize { 2 }
fn default_reset_timeout_ms() -> u64 { 30_000 }
fn default_half_open_max_calls() -> usize { 1 }
fn default_queue_max_size() -> usize { 1000 }
fn default_queue_batch_size() -> usize { 50 }
fn default_queue_batch_delay_ms() -> u64 { 100 }
fn default_queue_max_retries() -> u32 { 3 }
fn default_persist_debounce_ms() -> u64 { 1_000 }
fn default_cache_size() -> usize { 200 }
fn default_cache_ttl_ms() -> u64 { 120_000 }
fn default_cache_sweep_ms() -> u64 { 60_000 }
fn default_health_interval_ms() -> u64 { 30_000 }
fn default_http_probe_timeout_ms() -> u64 { 500 }
fn default_health_check_timeout_ms() -> u64 { 5_000 }
fn default_max_inflight() -> usize { 100 }
fn default_top_k() -> usize { 5 }
fn default_embedding_model() -> String { "unknown".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            url: None,
            auth_token: None,
            tenant: default_tenant(),
            database: default_database(),
            files_collection: default_files_collection(),
            folders_collection: default_folders_collection(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_ms: default_operation_timeout_ms(),
            init_ms: default_init_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            call_timeout_ms: default_operation_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            batch_size: default_queue_batch_size(),
            batch_delay_ms: default_queue_batch_delay_ms(),
            max_retries: default_queue_max_retries(),
            persist_path: None,
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            ttl_ms: default_cache_ttl_ms(),
            sweep_interval_ms: default_cache_sweep_ms(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            http_timeout_ms: default_http_probe_timeout_ms(),
            check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            default_top_k: default_top_k(),
        }
    }
}

impl Default for IndexMetadataSettings {
    fn default() -> Self {
        Self {
            path: None,
            embedding_model: default_embedding_model(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    /// Base URL without a trailing slash
    pub fn base_url(&self) -> String {
        match &self.url {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }

    /// Host part of the effective URL
    pub fn effective_host(&self) -> String {
        match &self.url {
            Some(url) if !url.trim().is_empty() => reqwest::Url::parse(url.trim())
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default(),
            _ => self.host.clone(),
        }
    }

    /// Plain HTTP to a host that is not the local machine
    pub fn is_insecure_remote(&self) -> bool {
        let base = self.base_url();
        if !base.starts_with("http://") {
            return false;
        }
        let host = self.effective_host();
        !LOCAL_HOSTS.contains(&host.as_str())
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_ref().map(|t| t.expose_secret().as_str())
    }
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    /// Batch calls move more data and get twice the budget
    pub fn batch_operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms.saturating_mul(2))
    }

    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let config = loader::load_config(path)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from defaults and environment variables only
    pub fn from_env() -> crate::error::Result<Self> {
        let config = loader::load_from_env()?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Validate this configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validation::validate_config(self)
    }
}

/// Custom serializer for Option<Secret<String>>
fn serialize_optional_secret<S>(secret: &Option<Secret<String>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// Custom deserializer for Option<Secret<String>>
fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|s| !s.is_empty()).map(Secret::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_from_parts() {
        let server = ServerConfig::default();
        assert_eq!(server.base_url(), "http://127.0.0.1:8000");
        assert!(!server.is_insecure_remote());
    }

    #[test]
    fn test_url_override_wins() {
        let server = ServerConfig {
            url: Some("https://chroma.internal:9000/".to_string()),
            ..ServerConfig::default()
        };
        assert_eq!(server.base_url(), "https://chroma.internal:9000");
        assert_eq!(server.effective_host(), "chroma.internal");
        assert!(!server.is_insecure_remote());
    }

    #[test]
    fn test_insecure_remote_detection() {
        let server = ServerConfig {
            host: "10.0.0.12".to_string(),
            ..ServerConfig::default()
        };
        assert!(server.is_insecure_remote());
    }

    #[test]
    fn test_batch_timeout_is_doubled() {
        let timeouts = TimeoutConfig { operation_ms: 1500, init_ms: 10 };
        assert_eq!(timeouts.batch_operation(), Duration::from_millis(3000));
    }
}
