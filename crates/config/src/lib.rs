//! Configuration for the dialogue TTS service
//!
//! Settings are layered: `config/default` file, then an optional
//! environment-specific file, then `PODCAST_TTS__`-prefixed environment
//! variables. Everything has a serde default so the service boots with no
//! files present.

pub mod settings;

pub use settings::{
    load_settings, EngineConfig, ObservabilityConfig, ProviderConfig, ServerConfig, Settings,
    StorageConfig, StoreConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
