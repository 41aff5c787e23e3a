//! Main settings module

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Remote TTS provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Task engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Shared-store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Blob storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Voice profiles assigned to speakers in first-appearance order
    #[serde(default = "default_voices")]
    pub voices: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            storage: StorageConfig::default(),
            observability: ObservabilityConfig::default(),
            voices: default_voices(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voices.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "voices".to_string(),
                message: "at least one voice profile is required".to_string(),
            });
        }

        if self.engine.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_concurrent_tasks".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.engine.max_concurrent_segments == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_concurrent_segments".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.engine.max_turns_per_segment == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_turns_per_segment".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.engine.segment_max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.segment_max_retries".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        // Byte-level concatenation of segment output is only append-safe for
        // the default codec.
        if self.provider.codec != "mp3" {
            return Err(ConfigError::InvalidValue {
                field: "provider.codec".to_string(),
                message: format!(
                    "unsupported codec '{}': only mp3 output can be concatenated",
                    self.provider.codec
                ),
            });
        }

        if self.provider.app_id.is_empty() || self.provider.access_token.is_empty() {
            tracing::warn!("provider credentials not configured; synthesis will fail at connect");
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// CORS allowed origins (empty = none)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Subscription idle ceiling in seconds
    #[serde(default = "default_stream_idle")]
    pub stream_idle_seconds: u64,

    /// Keepalive interval for event streams in seconds
    #[serde(default = "default_stream_keepalive")]
    pub stream_keepalive_seconds: u64,
}

impl ServerConfig {
    pub fn stream_idle(&self) -> Duration {
        Duration::from_secs(self.stream_idle_seconds)
    }

    pub fn stream_keepalive(&self) -> Duration {
        Duration::from_secs(self.stream_keepalive_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            stream_idle_seconds: default_stream_idle(),
            stream_keepalive_seconds: default_stream_keepalive(),
        }
    }
}

/// Remote provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// WebSocket endpoint for the streaming synthesis API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Application id sent in connect-time headers
    #[serde(default)]
    pub app_id: String,

    /// Access token sent in connect-time headers
    /// (set via PODCAST_TTS__PROVIDER__ACCESS_TOKEN)
    #[serde(default)]
    pub access_token: String,

    /// Provider resource id
    #[serde(default = "default_resource_id")]
    pub resource_id: String,

    /// Output codec; only mp3 is append-safe for concatenation
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Idle timeout between frames in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Total per-session timeout in seconds
    #[serde(default = "default_total_timeout")]
    pub total_timeout_seconds: u64,

    /// Provider status codes treated as retryable
    #[serde(default = "default_transient_codes")]
    pub transient_error_codes: Vec<i32>,
}

impl ProviderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_seconds)
    }

    pub fn is_transient_code(&self, code: i32) -> bool {
        self.transient_error_codes.contains(&code)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            app_id: String::new(),
            access_token: String::new(),
            resource_id: default_resource_id(),
            codec: default_codec(),
            sample_rate: default_sample_rate(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            total_timeout_seconds: default_total_timeout(),
            transient_error_codes: default_transient_codes(),
        }
    }
}

/// Task engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fleet-wide ceiling on concurrently running tasks
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Parallel batch size within one task
    #[serde(default = "default_max_concurrent_segments")]
    pub max_concurrent_segments: usize,

    /// Maximum turns packed into one segment
    #[serde(default = "default_max_turns_per_segment")]
    pub max_turns_per_segment: usize,

    /// Character count at and above which the parallel strategy is used
    #[serde(default = "default_long_text_threshold")]
    pub long_text_threshold: usize,

    /// Linear backoff base between segment attempts, in seconds
    #[serde(default = "default_retry_delay_base")]
    pub segment_retry_delay_base_seconds: u64,

    /// Attempts per segment
    #[serde(default = "default_segment_max_retries")]
    pub segment_max_retries: u32,

    /// Sweep threshold for tasks stuck in processing, in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,

    /// Timeout sweeper interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Content-hash dedup window in seconds
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: u64,

    /// Global limiter slot TTL in seconds
    #[serde(default = "default_slot_ttl")]
    pub slot_ttl_seconds: u64,

    /// Slot renewal interval in seconds
    #[serde(default = "default_slot_renew")]
    pub slot_renew_seconds: u64,

    /// Retention of terminal tasks in the monitor's hot map, in seconds
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_seconds: u64,

    /// Submission size guard in characters
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

impl EngineConfig {
    pub fn segment_retry_delay_base(&self) -> Duration {
        Duration::from_secs(self.segment_retry_delay_base_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn slot_ttl(&self) -> Duration {
        Duration::from_secs(self.slot_ttl_seconds)
    }

    pub fn slot_renew(&self) -> Duration {
        Duration::from_secs(self.slot_renew_seconds)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_concurrent_segments: default_max_concurrent_segments(),
            max_turns_per_segment: default_max_turns_per_segment(),
            long_text_threshold: default_long_text_threshold(),
            segment_retry_delay_base_seconds: default_retry_delay_base(),
            segment_max_retries: default_segment_max_retries(),
            task_timeout_seconds: default_task_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
            idempotency_ttl_seconds: default_idempotency_ttl(),
            slot_ttl_seconds: default_slot_ttl(),
            slot_renew_seconds: default_slot_renew(),
            terminal_retention_seconds: default_terminal_retention(),
            max_text_length: default_max_text_length(),
        }
    }
}

/// Shared-store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key namespace prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Startup connectivity probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl StoreConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            namespace: default_namespace(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the filesystem blob store
    #[serde(default = "default_storage_root")]
    pub root: String,

    /// Public base URL prepended to object keys
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Whether uploaded objects are publicly readable
    #[serde(default = "default_true")]
    pub public_read: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            public_base_url: default_public_base_url(),
            public_read: default_true(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}
fn default_stream_idle() -> u64 {
    300
}
fn default_stream_keepalive() -> u64 {
    15
}
fn default_endpoint() -> String {
    "wss://speech.example.com/api/v3/dialogue_tts".to_string()
}
fn default_resource_id() -> String {
    "speech.dialogue_tts".to_string()
}
fn default_codec() -> String {
    "mp3".to_string()
}
fn default_sample_rate() -> u32 {
    24000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_total_timeout() -> u64 {
    120
}
fn default_transient_codes() -> Vec<i32> {
    vec![45000292, 55000001]
}
fn default_max_concurrent_tasks() -> usize {
    3
}
fn default_max_concurrent_segments() -> usize {
    10
}
fn default_max_turns_per_segment() -> usize {
    10
}
fn default_long_text_threshold() -> usize {
    2000
}
fn default_retry_delay_base() -> u64 {
    1
}
fn default_segment_max_retries() -> u32 {
    3
}
fn default_task_timeout() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_idempotency_ttl() -> u64 {
    86400
}
fn default_slot_ttl() -> u64 {
    1800
}
fn default_slot_renew() -> u64 {
    60
}
fn default_terminal_retention() -> u64 {
    3600
}
fn default_max_text_length() -> usize {
    25000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_namespace() -> String {
    "tts_tasks".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_storage_root() -> String {
    "data/blobs".to_string()
}
fn default_public_base_url() -> String {
    "http://127.0.0.1:8080/blobs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_voices() -> Vec<String> {
    vec![
        "female_warm_v2_dialogue".to_string(),
        "male_calm_v2_dialogue".to_string(),
    ]
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (PODCAST_TTS prefix, `__` separator)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("PODCAST_TTS")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.engine.long_text_threshold, 2000);
        assert_eq!(settings.engine.max_turns_per_segment, 10);
        assert_eq!(settings.provider.sample_rate, 24000);
        assert_eq!(settings.voices.len(), 2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let mut settings = Settings::default();
        settings.engine.max_concurrent_segments = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_codec() {
        let mut settings = Settings::default();
        settings.provider.codec = "opus".to_string();
        assert!(settings.validate().is_err());

        settings.provider.codec = "mp3".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_transient_code_lookup() {
        let provider = ProviderConfig::default();
        assert!(provider.is_transient_code(45000292));
        assert!(!provider.is_transient_code(40000001));
    }
}
