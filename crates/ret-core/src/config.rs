//! Tracker configuration
//!
//! Loaded from a TOML file, then overridden from `RET_*` environment
//! variables. Every field has a default so an empty file is valid.

use crate::error::ConfigError;
use crate::policy::{PolicySettings, StageSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Env: global escalation switch
pub const ENV_ESCALATION_ENABLED: &str = "RET_ESCALATION_ENABLED";
/// Env: comma-separated stage delays in minutes
pub const ENV_STAGE_DELAYS_MINUTES: &str = "RET_STAGE_DELAYS_MINUTES";
/// Env: notifier timeout in milliseconds
pub const ENV_DELIVERY_TIMEOUT_MS: &str = "RET_DELIVERY_TIMEOUT_MS";
/// Env: policy cache TTL in seconds
pub const ENV_POLICY_CACHE_TTL_SECS: &str = "RET_POLICY_CACHE_TTL_SECS";
/// Env: JSON log output
pub const ENV_LOG_JSON: &str = "RET_LOG_JSON";

const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLICY_CACHE_TTL_SECS: u64 = 300;

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// `tracing` filter directive
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Escalation policy
    #[serde(default)]
    pub escalation: PolicySettings,
    /// Bound on one notifier call
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// How long a loaded policy is reused
    #[serde(default = "default_policy_cache_ttl_secs")]
    pub policy_cache_ttl_secs: u64,
    /// Logging
    #[serde(default)]
    pub log: LogSettings,
}

fn default_delivery_timeout_ms() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_MS
}

fn default_policy_cache_ttl_secs() -> u64 {
    DEFAULT_POLICY_CACHE_TTL_SECS
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            escalation: PolicySettings::default(),
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            policy_cache_ttl_secs: DEFAULT_POLICY_CACHE_TTL_SECS,
            log: LogSettings::default(),
        }
    }
}

impl TrackerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML or unknown value types.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, else as
    /// [`Self::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load a file, apply process environment overrides, validate
    ///
    /// # Errors
    /// Any [`ConfigError`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RET_*` overrides from the process environment
    ///
    /// # Errors
    /// `ConfigError::Env` when a variable is set but malformed.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    /// Apply `RET_*` overrides read through `lookup`
    ///
    /// # Errors
    /// `ConfigError::Env` when a variable is set but malformed.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_ESCALATION_ENABLED) {
            self.escalation.enabled = parse_bool(ENV_ESCALATION_ENABLED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STAGE_DELAYS_MINUTES) {
            let minutes = parse_minutes_list(&raw)?;
            self.escalation.stages = relabel_stages(&self.escalation.stages, &minutes);
        }
        if let Some(raw) = lookup(ENV_DELIVERY_TIMEOUT_MS) {
            self.delivery_timeout_ms = parse_u64(ENV_DELIVERY_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_POLICY_CACHE_TTL_SECS) {
            self.policy_cache_ttl_secs = parse_u64(ENV_POLICY_CACHE_TTL_SECS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_JSON) {
            self.log.json = parse_bool(ENV_LOG_JSON, &raw)?;
        }
        Ok(self)
    }

    /// Check every constraint
    ///
    /// # Errors
    /// `ConfigError::Invalid` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "delivery_timeout_ms must be non-zero".to_string(),
            ));
        }
        self.escalation.validate()?;
        Ok(())
    }

    /// With escalation settings
    #[inline]
    #[must_use]
    pub fn with_escalation(mut self, escalation: PolicySettings) -> Self {
        self.escalation = escalation;
        self
    }

    /// With notifier timeout
    #[inline]
    #[must_use]
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With policy cache TTL
    #[inline]
    #[must_use]
    pub fn with_policy_cache_ttl(mut self, ttl: Duration) -> Self {
        self.policy_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Notifier timeout
    #[inline]
    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Policy cache TTL
    #[inline]
    #[must_use]
    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_cache_ttl_secs)
    }
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Env {
            var: var.to_string(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_u64(var: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::Env {
        var: var.to_string(),
        reason: format!("{e}"),
    })
}

fn parse_minutes_list(raw: &str) -> Result<Vec<u64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_u64(ENV_STAGE_DELAYS_MINUTES, s))
        .collect()
}

/// Stages for `minutes`. A stage keeps its existing label only when its
/// threshold is unchanged; otherwise the label follows the new threshold.
fn relabel_stages(existing: &[StageSpec], minutes: &[u64]) -> Vec<StageSpec> {
    minutes
        .iter()
        .enumerate()
        .map(|(i, &m)| {
            let threshold = Duration::from_secs(m.saturating_mul(60));
            let label = existing
                .get(i)
                .filter(|s| s.threshold().is_ok_and(|t| t == threshold))
                .map_or_else(|| format!("warning_{m}"), |s| s.label.clone());
            StageSpec::minutes(label, m)
        })
        .collect()
}
