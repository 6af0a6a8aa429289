//! Global operator configuration, loaded from an optional `config.toml`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Operator-configured resource ceiling for one quota level. Dimensions
/// left out keep the built-in default for that level.
///
/// ```toml
/// [repo_limits."ex/lib"]
/// cpu = "4"
/// memory = "2Gi"
///
/// [step_limits."ex/lib".publish]
/// cpu = "500m"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaOverride {
    /// CPU ceiling, cores or millicores (`"4"`, `"500m"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory ceiling as a byte quantity (`"2Gi"`, `"512MB"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Engine-wide tunables. Every field has a serde default so a partial (or
/// absent) `config.toml` still yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Workspace root override (state, locks, fan-out journals, children).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    /// Repository cache root override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// TTL stamped into lock records.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Default bound for lock acquisition.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Child-runner concurrency bound.
    #[serde(default = "default_max_concurrent_repos")]
    pub max_concurrent_repos: usize,
    /// Byte budget for the compiled-template cache.
    #[serde(default = "default_template_cache_bytes")]
    pub template_cache_bytes: usize,
    /// Entry bound for the compiled-filter cache.
    #[serde(default = "default_filter_cache_entries")]
    pub filter_cache_entries: usize,
    /// Usage sampling interval.
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
    /// Fraction of a quota that triggers a warning callback.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Bound on retained usage samples.
    #[serde(default = "default_usage_history_limit")]
    pub usage_history_limit: usize,
    /// Drop disabled subscriptions during discovery.
    #[serde(default = "default_true")]
    pub drop_disabled_subscriptions: bool,
    /// Sort matches by `(repository, workflow)` for determinism.
    #[serde(default = "default_true")]
    pub prioritize_matches: bool,
    /// Per-repository quota ceilings, keyed by `owner/repo`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repo_limits: BTreeMap<String, QuotaOverride>,
    /// Per-step quota ceilings, keyed by `owner/repo`, then step id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_limits: BTreeMap<String, BTreeMap<String, QuotaOverride>>,
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_repos() -> usize {
    4
}

fn default_template_cache_bytes() -> usize {
    1024 * 1024
}

fn default_filter_cache_entries() -> usize {
    256
}

fn default_monitoring_interval_secs() -> u64 {
    10
}

fn default_warning_threshold() -> f64 {
    0.8
}

fn default_usage_history_limit() -> usize {
    360
}

fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            workspace_dir: None,
            cache_dir: None,
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            max_concurrent_repos: default_max_concurrent_repos(),
            template_cache_bytes: default_template_cache_bytes(),
            filter_cache_entries: default_filter_cache_entries(),
            monitoring_interval_secs: default_monitoring_interval_secs(),
            warning_threshold: default_warning_threshold(),
            usage_history_limit: default_usage_history_limit(),
            drop_disabled_subscriptions: true,
            prioritize_matches: true,
            repo_limits: BTreeMap::new(),
            step_limits: BTreeMap::new(),
        }
    }
}
