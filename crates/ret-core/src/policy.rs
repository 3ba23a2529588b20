//! Delay policy: the escalation thresholds in force
//!
//! The policy is a read model. Settings come from a [`PolicySource`] that the
//! surrounding configuration subsystem owns; [`DelayPolicy::snapshot`] turns
//! them into an immutable [`PolicySnapshot`] that a tracked message keeps for
//! its whole life. Loaded snapshots are cached for a configurable TTL.

use crate::config::TrackerConfig;
use crate::error::ConfigError;
use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default stage thresholds in minutes
pub const DEFAULT_STAGE_MINUTES: [u64; 3] = [15, 30, 60];

/// One configured stage as written in settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage label (escalation severity name)
    pub label: String,
    /// Threshold in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_minutes: Option<u64>,
    /// Threshold in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_secs: Option<u64>,
}

impl StageSpec {
    /// Stage firing after `minutes`
    #[inline]
    #[must_use]
    pub fn minutes(label: impl Into<String>, minutes: u64) -> Self {
        Self {
            label: label.into(),
            after_minutes: Some(minutes),
            after_secs: None,
        }
    }

    /// Stage firing after `secs`
    #[inline]
    #[must_use]
    pub fn secs(label: impl Into<String>, secs: u64) -> Self {
        Self {
            label: label.into(),
            after_minutes: None,
            after_secs: Some(secs),
        }
    }

    /// Threshold as a duration
    ///
    /// # Errors
    /// `ConfigError::Invalid` unless exactly one unit is given.
    pub fn threshold(&self) -> Result<Duration, ConfigError> {
        match (self.after_minutes, self.after_secs) {
            (Some(m), None) => Ok(Duration::from_secs(m.saturating_mul(60))),
            (None, Some(s)) => Ok(Duration::from_secs(s)),
            _ => Err(ConfigError::Invalid(format!(
                "stage '{}' must set exactly one of after_minutes / after_secs",
                self.label
            ))),
        }
    }
}

/// Escalation settings as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Global escalation switch
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ordered stages
    #[serde(default = "default_stages")]
    pub stages: Vec<StageSpec>,
}

fn default_enabled() -> bool {
    true
}

fn default_stages() -> Vec<StageSpec> {
    DEFAULT_STAGE_MINUTES
        .iter()
        .map(|m| StageSpec::minutes(format!("warning_{m}"), *m))
        .collect()
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            stages: default_stages(),
        }
    }
}

impl PolicySettings {
    /// Enabled settings with the given stages
    #[inline]
    #[must_use]
    pub fn with_stages(stages: Vec<StageSpec>) -> Self {
        Self {
            enabled: true,
            stages,
        }
    }

    /// Set the global switch
    #[inline]
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Drop a stage by label
    #[must_use]
    pub fn without_stage(mut self, label: &str) -> Self {
        self.stages.retain(|s| s.label != label);
        self
    }

    /// Validate and freeze into a snapshot
    ///
    /// # Errors
    /// `ConfigError::Invalid` when a stage is malformed, labels repeat, or
    /// thresholds are zero or not strictly increasing.
    pub fn validate(&self) -> Result<PolicySnapshot, ConfigError> {
        if self.enabled && self.stages.is_empty() {
            return Err(ConfigError::Invalid(
                "escalation enabled without stages".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut previous = Duration::ZERO;

        for (ordinal, spec) in self.stages.iter().enumerate() {
            if spec.label.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage #{} has an empty label",
                    ordinal + 1
                )));
            }
            if !seen.insert(spec.label.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stage label '{}'",
                    spec.label
                )));
            }
            let threshold = spec.threshold()?;
            if threshold.is_zero() || threshold <= previous {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' threshold must be non-zero and after the previous stage",
                    spec.label
                )));
            }
            previous = threshold;
            stages.push(Stage {
                ordinal,
                label: spec.label.clone(),
                threshold,
            });
        }

        Ok(PolicySnapshot {
            enabled: self.enabled,
            stages: stages.into(),
        })
    }
}

/// One armed escalation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    /// Position in the policy (0-based)
    pub ordinal: usize,
    /// Stage label
    pub label: String,
    /// Delay from tracking start
    pub threshold: Duration,
}

/// Immutable policy captured when tracking starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    enabled: bool,
    stages: Arc<[Stage]>,
}

impl PolicySnapshot {
    /// Snapshot of the built-in defaults
    #[must_use]
    pub fn default_policy() -> Self {
        let stages: Vec<Stage> = DEFAULT_STAGE_MINUTES
            .iter()
            .enumerate()
            .map(|(ordinal, m)| Stage {
                ordinal,
                label: format!("warning_{m}"),
                threshold: Duration::from_secs(m * 60),
            })
            .collect();
        Self {
            enabled: true,
            stages: stages.into(),
        }
    }

    /// Snapshot that arms nothing
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            stages: Arc::from(Vec::new()),
        }
    }

    /// Whether escalation is on
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Ordered stages
    #[inline]
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stages that will actually be armed
    #[inline]
    #[must_use]
    pub fn armed_stages(&self) -> &[Stage] {
        if self.enabled {
            &self.stages
        } else {
            &[]
        }
    }

    /// Stage by label
    #[must_use]
    pub fn stage(&self, label: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.label == label)
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self::default_policy()
    }
}

/// Where policy settings come from
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Load the current settings
    async fn load(&self) -> Result<PolicySettings, ConfigError>;
}

/// Fixed settings
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    settings: PolicySettings,
}

impl StaticPolicySource {
    /// Create source serving `settings`
    #[inline]
    #[must_use]
    pub fn new(settings: PolicySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn load(&self) -> Result<PolicySettings, ConfigError> {
        Ok(self.settings.clone())
    }
}

/// Settings that another part of the process can replace at runtime
#[derive(Debug, Default)]
pub struct SharedPolicySource {
    settings: RwLock<PolicySettings>,
}

impl SharedPolicySource {
    /// Create source holding `settings`
    #[inline]
    #[must_use]
    pub fn new(settings: PolicySettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Replace the settings
    pub fn set(&self, settings: PolicySettings) {
        *self.settings.write() = settings;
    }

    /// Current settings
    #[must_use]
    pub fn get(&self) -> PolicySettings {
        self.settings.read().clone()
    }
}

#[async_trait]
impl PolicySource for SharedPolicySource {
    async fn load(&self) -> Result<PolicySettings, ConfigError> {
        Ok(self.get())
    }
}

/// Re-reads the `[escalation]` table of a config file on every load
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    /// Create source reading `path`
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn load(&self) -> Result<PolicySettings, ConfigError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(TrackerConfig::from_toml_str(&text)?.escalation)
    }
}

/// Read model over a policy source
pub struct DelayPolicy {
    source: Arc<dyn PolicySource>,
    cache: Option<Cache<(), PolicySnapshot>>,
}

impl std::fmt::Debug for DelayPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayPolicy")
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl DelayPolicy {
    /// Create policy reading `source`, caching snapshots for `ttl`.
    ///
    /// A zero TTL re-reads the source on every snapshot.
    #[must_use]
    pub fn new(source: Arc<dyn PolicySource>, ttl: Duration) -> Self {
        let cache = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(1)
                .time_to_live(ttl)
                .build()
        });
        Self { source, cache }
    }

    /// Policy over fixed settings, never cached
    #[must_use]
    pub fn fixed(settings: PolicySettings) -> Self {
        Self::new(Arc::new(StaticPolicySource::new(settings)), Duration::ZERO)
    }

    /// Current policy snapshot.
    ///
    /// A failing or invalid source falls back to the built-in defaults; the
    /// fallback is not cached so the next call retries the source.
    pub async fn snapshot(&self) -> PolicySnapshot {
        if let Some(cache) = &self.cache {
            if let Some(snapshot) = cache.get(&()).await {
                return snapshot;
            }
        }

        match self.source.load().await.and_then(|s| s.validate()) {
            Ok(snapshot) => {
                tracing::debug!(
                    stages = snapshot.stages().len(),
                    enabled = snapshot.is_enabled(),
                    "Policy loaded"
                );
                if let Some(cache) = &self.cache {
                    cache.insert((), snapshot.clone()).await;
                }
                snapshot
            }
            Err(e) => {
                tracing::error!(error = %e, "Policy source failed, using defaults");
                PolicySnapshot::default_policy()
            }
        }
    }

    /// Drop the cached snapshot so the next call re-reads the source
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct BrokenSource;

    #[async_trait]
    impl PolicySource for BrokenSource {
        async fn load(&self) -> Result<PolicySettings, ConfigError> {
            Err(ConfigError::Invalid("settings table missing".into()))
        }
    }

    #[test]
    fn default_settings_match_default_snapshot() {
        let snapshot = PolicySettings::default().validate().unwrap();
        assert_eq!(snapshot, PolicySnapshot::default_policy());
        let labels: Vec<_> = snapshot.stages().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["warning_15", "warning_30", "warning_60"]);
    }

    #[test]
    fn validation_rejects_bad_stages() {
        let dup = PolicySettings::with_stages(vec![
            StageSpec::minutes("a", 5),
            StageSpec::minutes("a", 10),
        ]);
        assert!(dup.validate().is_err());

        let unordered = PolicySettings::with_stages(vec![
            StageSpec::minutes("a", 10),
            StageSpec::minutes("b", 5),
        ]);
        assert!(unordered.validate().is_err());

        let zero = PolicySettings::with_stages(vec![StageSpec::secs("a", 0)]);
        assert!(zero.validate().is_err());

        let both = StageSpec {
            label: "x".into(),
            after_minutes: Some(1),
            after_secs: Some(1),
        };
        assert!(both.threshold().is_err());

        let empty = PolicySettings::with_stages(vec![]);
        assert!(empty.validate().is_err());
        assert!(empty.enabled(false).validate().is_ok());
    }

    #[test]
    fn disabled_snapshot_arms_nothing() {
        let snapshot = PolicySettings::default().enabled(false).validate().unwrap();
        assert!(!snapshot.is_enabled());
        assert_eq!(snapshot.stages().len(), 3);
        assert!(snapshot.armed_stages().is_empty());
    }

    #[test]
    fn without_stage_keeps_ordinals_dense() {
        let snapshot = PolicySettings::default()
            .without_stage("warning_30")
            .validate()
            .unwrap();
        let stage = snapshot.stage("warning_60").unwrap();
        assert_eq!(stage.ordinal, 1);
        assert_eq!(stage.threshold, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_invalidated() {
        let source = Arc::new(SharedPolicySource::new(PolicySettings::default()));
        let policy = DelayPolicy::new(source.clone(), Duration::from_secs(300));

        let first = policy.snapshot().await;
        source.set(PolicySettings::with_stages(vec![StageSpec::minutes("only", 1)]));

        assert_eq!(policy.snapshot().await, first);

        policy.invalidate();
        let fresh = policy.snapshot().await;
        assert_eq!(fresh.stages().len(), 1);
        assert_eq!(fresh.stages()[0].label, "only");
    }

    #[tokio::test]
    async fn uncached_policy_sees_updates() {
        let source = Arc::new(SharedPolicySource::new(PolicySettings::default()));
        let policy = DelayPolicy::new(source.clone(), Duration::ZERO);
        source.set(PolicySettings::default().enabled(false));
        assert!(!policy.snapshot().await.is_enabled());
    }

    #[tokio::test]
    async fn broken_source_falls_back_to_defaults() {
        let policy = DelayPolicy::new(Arc::new(BrokenSource), Duration::from_secs(60));
        assert_eq!(policy.snapshot().await, PolicySnapshot::default_policy());
    }

    #[tokio::test]
    async fn file_source_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ret.toml");
        std::fs::write(
            &path,
            "[escalation]\nstages = [{ label = \"w1\", after_secs = 30 }]\n",
        )
        .unwrap();

        let policy = DelayPolicy::new(Arc::new(FilePolicySource::new(&path)), Duration::ZERO);
        assert_eq!(policy.snapshot().await.stages()[0].label, "w1");

        std::fs::write(&path, "[escalation]\nenabled = false\n").unwrap();
        assert!(!policy.snapshot().await.is_enabled());
    }
}
