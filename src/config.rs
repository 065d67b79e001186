//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{RuleSet, DEFAULT_MAX_ENTRIES};

/// Prefix for environment overrides, e.g. `TOLLGATE__LIMITER__MAX_ENTRIES`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiter storage and cleanup
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Path to a YAML rule table; the built-in table is used when unset
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter storage and cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Seconds between cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Ceiling on stored buckets after a sweep
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Number of map shards; must be a power of two greater than one
    #[serde(default)]
    pub shard_amount: Option<usize>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            max_entries: default_max_entries(),
            shard_amount: None,
        }
    }
}

impl LimiterSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file layered under
    /// `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        Self::build(builder, env_source())
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: config::Environment,
    ) -> Result<Self> {
        let config: TollgateConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.cleanup_interval_secs == 0 {
            return Err(TollgateError::Config(
                "limiter.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.limiter.max_entries == 0 {
            return Err(TollgateError::Config(
                "limiter.max_entries must be greater than zero".to_string(),
            ));
        }
        if let Some(shards) = self.limiter.shard_amount {
            if shards < 2 || !shards.is_power_of_two() {
                return Err(TollgateError::Config(format!(
                    "limiter.shard_amount must be a power of two greater than one, got {}",
                    shards
                )));
            }
        }
        Ok(())
    }

    /// Load the configured rule table, or the built-in one.
    pub fn load_rules(&self) -> Result<RuleSet> {
        match &self.rules_path {
            Some(path) => RuleSet::from_file(path),
            None => Ok(RuleSet::default()),
        }
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
