//! Configuration management for Slidegate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{GateError, Result};
use crate::guard::{FailurePolicy, PolicyConfig};
use crate::ratelimit::DEFAULT_BUCKET_COUNT;
use crate::store::StoreBackend;

/// Prefix for environment overrides, e.g. `SLIDEGATE__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for Slidegate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Request-side configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Rule and key strategy used by the implicit "default" policy
    #[serde(default)]
    pub defaults: PolicyConfig,

    /// Named policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Sub-buckets per window
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,

    /// What the guard does when the store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            bucket_count: default_bucket_count(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_bucket_count() -> u32 {
    DEFAULT_BUCKET_COUNT
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend holds the counters
    #[serde(default)]
    pub backend: StoreBackend,

    /// Maximum entries held by the in-process store
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Namespace for keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Redis per-command timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            max_size: default_max_size(),
            key_prefix: default_key_prefix(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

fn default_max_size() -> usize {
    200_000
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_response_timeout() -> u64 {
    500
}

/// Request-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Emit X-RateLimit-* and Retry-After headers
    #[serde(default = "default_true")]
    pub send_headers: bool,

    /// Trust X-Forwarded-For / X-Real-IP when resolving client IPs
    #[serde(default = "default_true")]
    pub include_forwarded_for: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            send_headers: true,
            include_forwarded_for: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load an optional YAML file layered under `SLIDEGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: GateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.bucket_count == 0 {
            return Err(GateError::Config("limiter.bucket_count must be > 0".to_string()));
        }

        if self.store.max_size == 0 {
            return Err(GateError::Config("store.max_size must be > 0".to_string()));
        }

        self.defaults.validate()?;

        let mut names = HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !names.insert(policy.name.as_str()) {
                return Err(GateError::Config(format!(
                    "duplicate policy name: {}",
                    policy.name
                )));
            }
        }

        Ok(())
    }
}
