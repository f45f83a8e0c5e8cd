//! Configuration management for tollgate backends.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Top-level configuration, one section per distributed backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Conditional-write backend configuration
    #[serde(default)]
    pub conditional: ConditionalConfig,

    /// Redis script backend configuration
    #[serde(default)]
    pub script: ScriptConfig,
}

/// Configuration for [`ConditionalRateLimiter`](crate::ratelimit::ConditionalRateLimiter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalConfig {
    /// Table holding live bucket state
    #[serde(default = "default_token_table")]
    pub token_table: String,

    /// Table holding configured limits
    #[serde(default = "default_limit_table")]
    pub limit_table: String,

    /// Service tag written alongside every limit this instance stores
    #[serde(default)]
    pub service_name: Option<String>,

    /// How long a fetched limit is reused, in milliseconds (0 disables)
    #[serde(default)]
    pub limit_cache_ttl_ms: u64,
}

impl Default for ConditionalConfig {
    fn default() -> Self {
        Self {
            token_table: default_token_table(),
            limit_table: default_limit_table(),
            service_name: None,
            limit_cache_ttl_ms: 0,
        }
    }
}

impl ConditionalConfig {
    /// The limit cache TTL as a duration.
    pub fn limit_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.limit_cache_ttl_ms)
    }
}

fn default_token_table() -> String {
    "token".to_string()
}

fn default_limit_table() -> String {
    "limit".to_string()
}

/// Configuration for [`RedisRateLimiter`](crate::ratelimit::RedisRateLimiter).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Namespace prepended to every Redis key
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// How long a fetched limit is reused, in milliseconds (0 disables)
    #[serde(default)]
    pub limit_cache_ttl_ms: u64,
}

impl ScriptConfig {
    /// The limit cache TTL as a duration.
    pub fn limit_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.limit_cache_ttl_ms)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tollgate configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
