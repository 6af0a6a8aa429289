//! Hierarchical resource quotas and host usage monitoring.
//!
//! Quotas exist at three levels: global, per-repository, per-step. A
//! request is validated against the most specific explicitly-configured
//! level (step, then repository, then global). The monitoring loop samples
//! host usage on an interval, keeps a bounded history, and fires registered
//! callbacks when usage crosses the warning threshold or breaches a quota
//! -- at most once per resource per sample.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use sysinfo::System;
use tako_types::config::QuotaOverride;
use tako_types::resource::{
    parse_cpu, parse_memory_mb, ResourceError, ResourceLimits, UsageSample,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MB: f64 = 1024.0 * 1024.0;

/// Built-in per-repository limits applied when a repository is registered
/// without explicit values.
pub const DEFAULT_REPO_LIMITS: ResourceLimits = ResourceLimits {
    cpu_cores: 2.0,
    memory_mb: 1024.0,
    disk_mb: None,
};

/// Built-in per-step limits applied when a step is registered without
/// explicit values.
pub const DEFAULT_STEP_LIMITS: ResourceLimits = ResourceLimits {
    cpu_cores: 1.0,
    memory_mb: 512.0,
    disk_mb: None,
};

/// Default global quota: 80% of host cores and 4 GiB of memory.
pub fn default_global_limits() -> ResourceLimits {
    ResourceLimits {
        cpu_cores: (num_cpus::get() as f64 * 0.8).max(1.0),
        memory_mb: 4096.0,
        disk_mb: None,
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A resource request exceeded the effective hierarchical limit.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("cpu request of {requested} cores exceeds the {limit}-core limit for {scope}")]
    CpuExceeded {
        requested: f64,
        limit: f64,
        scope: String,
    },

    #[error("memory request of {requested} MB exceeds the {limit} MB limit for {scope}")]
    MemoryExceeded {
        requested: f64,
        limit: f64,
        scope: String,
    },
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Threshold crossing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Usage crossed `warning_threshold` of the global quota.
    Warning,
    /// Usage reached or exceeded the global quota.
    Breach,
}

/// A threshold crossing observed in one sample.
#[derive(Debug, Clone)]
pub struct ResourceAlert {
    pub kind: AlertKind,
    /// `"cpu"` or `"memory"`.
    pub resource: &'static str,
    /// Usage as a fraction of the global quota.
    pub usage_fraction: f64,
}

type AlertCallback = Box<dyn Fn(&ResourceAlert) + Send + Sync>;

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

/// Monitoring configuration.
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub monitoring_interval: Duration,
    pub warning_threshold: f64,
    pub history_limit: usize,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(10),
            warning_threshold: 0.8,
            history_limit: 360,
        }
    }
}

/// Hierarchical quota validation plus host usage sampling.
pub struct ResourceManager {
    global: ResourceLimits,
    repo_limits: RwLock<HashMap<String, ResourceLimits>>,
    step_limits: RwLock<HashMap<(String, String), ResourceLimits>>,
    history: Mutex<VecDeque<UsageSample>>,
    callbacks: Mutex<Vec<AlertCallback>>,
    system: Mutex<System>,
    config: ResourceManagerConfig,
}

impl ResourceManager {
    /// Manager with the default global quota.
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self::with_global_limits(default_global_limits(), config)
    }

    /// Manager with an explicit global quota.
    pub fn with_global_limits(global: ResourceLimits, config: ResourceManagerConfig) -> Self {
        Self {
            global,
            repo_limits: RwLock::new(HashMap::new()),
            step_limits: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            system: Mutex::new(System::new()),
            config,
        }
    }

    /// The global quota.
    pub fn global_limits(&self) -> ResourceLimits {
        self.global
    }

    /// Register repository limits; `None` applies [`DEFAULT_REPO_LIMITS`].
    pub fn set_repo_limits(&self, repository: &str, limits: Option<ResourceLimits>) {
        self.repo_limits
            .write()
            .expect("repo limits poisoned")
            .insert(
                repository.to_string(),
                limits.unwrap_or(DEFAULT_REPO_LIMITS),
            );
    }

    /// Register step limits; `None` applies [`DEFAULT_STEP_LIMITS`].
    pub fn set_step_limits(
        &self,
        repository: &str,
        step: &str,
        limits: Option<ResourceLimits>,
    ) {
        self.step_limits
            .write()
            .expect("step limits poisoned")
            .insert(
                (repository.to_string(), step.to_string()),
                limits.unwrap_or(DEFAULT_STEP_LIMITS),
            );
    }

    /// Apply the operator's `config.toml` quota tables. Dimensions left
    /// out of an override keep the built-in default for that level.
    pub fn apply_quota_overrides(
        &self,
        repo_limits: &BTreeMap<String, QuotaOverride>,
        step_limits: &BTreeMap<String, BTreeMap<String, QuotaOverride>>,
    ) -> Result<(), ResourceError> {
        for (repository, quota) in repo_limits {
            self.set_repo_limits(
                repository,
                Some(resolve_override(quota, DEFAULT_REPO_LIMITS)?),
            );
        }
        for (repository, steps) in step_limits {
            for (step, quota) in steps {
                self.set_step_limits(
                    repository,
                    step,
                    Some(resolve_override(quota, DEFAULT_STEP_LIMITS)?),
                );
            }
        }
        Ok(())
    }

    /// The effective limit for `(repository, step)`: the most specific
    /// explicitly-configured level, falling back to the global quota.
    pub fn effective_limits(&self, repository: &str, step: &str) -> (ResourceLimits, String) {
        if let Some(limits) = self
            .step_limits
            .read()
            .expect("step limits poisoned")
            .get(&(repository.to_string(), step.to_string()))
        {
            return (*limits, format!("step '{step}' in repository '{repository}'"));
        }
        if let Some(limits) = self
            .repo_limits
            .read()
            .expect("repo limits poisoned")
            .get(repository)
        {
            return (*limits, format!("repository '{repository}'"));
        }
        (self.global, "global quota".to_string())
    }

    /// Validate a request against the effective limit.
    pub fn validate_resource_request(
        &self,
        repository: &str,
        step: &str,
        cpu_cores: f64,
        memory_mb: f64,
    ) -> Result<(), QuotaError> {
        let (limits, scope) = self.effective_limits(repository, step);
        if cpu_cores > limits.cpu_cores {
            return Err(QuotaError::CpuExceeded {
                requested: cpu_cores,
                limit: limits.cpu_cores,
                scope,
            });
        }
        if memory_mb > limits.memory_mb {
            return Err(QuotaError::MemoryExceeded {
                requested: memory_mb,
                limit: limits.memory_mb,
                scope,
            });
        }
        Ok(())
    }

    /// Register a threshold callback.
    pub fn on_threshold(&self, callback: impl Fn(&ResourceAlert) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("callbacks poisoned")
            .push(Box::new(callback));
    }

    /// A copy of the retained usage history, oldest first.
    pub fn usage_history(&self) -> Vec<UsageSample> {
        self.history
            .lock()
            .expect("history poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Take one host sample and feed it through history and thresholds.
    pub fn sample_once(&self) {
        let sample = {
            let mut system = self.system.lock().expect("system poisoned");
            system.refresh_cpu_usage();
            system.refresh_memory();
            UsageSample {
                timestamp: Utc::now(),
                cpu_percent: system.global_cpu_usage(),
                memory_used_mb: system.used_memory() as f64 / MB,
                memory_total_mb: system.total_memory() as f64 / MB,
            }
        };
        self.record_sample(sample);
    }

    /// Record a sample: append to the bounded history, then fire at most
    /// one alert per resource.
    pub fn record_sample(&self, sample: UsageSample) {
        {
            let mut history = self.history.lock().expect("history poisoned");
            history.push_back(sample);
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        let host_cores = num_cpus::get() as f64;
        let cpu_fraction =
            (sample.cpu_percent as f64 / 100.0) * host_cores / self.global.cpu_cores;
        let memory_fraction = sample.memory_used_mb / self.global.memory_mb;

        for (resource, fraction) in [("cpu", cpu_fraction), ("memory", memory_fraction)] {
            let kind = if fraction >= 1.0 {
                AlertKind::Breach
            } else if fraction >= self.config.warning_threshold {
                AlertKind::Warning
            } else {
                continue;
            };
            let alert = ResourceAlert {
                kind,
                resource,
                usage_fraction: fraction,
            };
            tracing::warn!(
                resource,
                fraction = format!("{fraction:.2}").as_str(),
                breach = (kind == AlertKind::Breach),
                "resource threshold crossed"
            );
            for callback in self.callbacks.lock().expect("callbacks poisoned").iter() {
                callback(&alert);
            }
        }
    }

    /// Spawn the sampling loop; it runs until the token is canceled.
    pub fn start_monitoring(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.monitoring_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.sample_once(),
                }
            }
        })
    }
}

/// Parse an override into concrete limits, filling omitted dimensions
/// from the level's default.
fn resolve_override(
    quota: &QuotaOverride,
    base: ResourceLimits,
) -> Result<ResourceLimits, ResourceError> {
    Ok(ResourceLimits {
        cpu_cores: match &quota.cpu {
            Some(spec) => parse_cpu(spec)?,
            None => base.cpu_cores,
        },
        memory_mb: match &quota.memory {
            Some(spec) => parse_memory_mb(spec)?,
            None => base.memory_mb,
        },
        disk_mb: base.disk_mb,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with_global(cpu: f64, memory_mb: f64) -> ResourceManager {
        ResourceManager::with_global_limits(
            ResourceLimits {
                cpu_cores: cpu,
                memory_mb,
                disk_mb: None,
            },
            ResourceManagerConfig {
                history_limit: 5,
                ..ResourceManagerConfig::default()
            },
        )
    }

    #[test]
    fn hierarchy_resolves_most_specific_level() {
        // Seed scenario: global CPU 8, repo 'r' CPU 4.
        let manager = manager_with_global(8.0, 8192.0);
        manager.set_repo_limits(
            "r",
            Some(ResourceLimits {
                cpu_cores: 4.0,
                memory_mb: 4096.0,
                disk_mb: None,
            }),
        );

        let err = manager
            .validate_resource_request("r", "build", 5.0, 256.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::CpuExceeded { limit, .. } if limit == 4.0));

        manager
            .validate_resource_request("r", "build", 3.0, 256.0)
            .unwrap();
    }

    #[test]
    fn unconfigured_repo_falls_back_to_global() {
        let manager = manager_with_global(8.0, 8192.0);
        manager
            .validate_resource_request("other", "build", 7.5, 8000.0)
            .unwrap();
        let err = manager
            .validate_resource_request("other", "build", 8.5, 100.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::CpuExceeded { .. }));
    }

    #[test]
    fn step_limits_beat_repo_limits() {
        let manager = manager_with_global(8.0, 8192.0);
        manager.set_repo_limits(
            "r",
            Some(ResourceLimits {
                cpu_cores: 4.0,
                memory_mb: 4096.0,
                disk_mb: None,
            }),
        );
        manager.set_step_limits("r", "tiny", None); // DEFAULT_STEP_LIMITS: 1 core / 512 MB

        let err = manager
            .validate_resource_request("r", "tiny", 2.0, 100.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::CpuExceeded { limit, .. } if limit == 1.0));

        let err = manager
            .validate_resource_request("r", "tiny", 0.5, 600.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::MemoryExceeded { limit, .. } if limit == 512.0));

        // Unregistered steps in the same repo use the repo limit.
        manager
            .validate_resource_request("r", "big", 3.5, 2048.0)
            .unwrap();
    }

    #[test]
    fn quota_overrides_populate_the_hierarchy() {
        // Seed scenario 7 driven entirely through operator config.
        let manager = manager_with_global(8.0, 8192.0);
        let repo_limits = BTreeMap::from([(
            "r".to_string(),
            QuotaOverride {
                cpu: Some("4".to_string()),
                memory: Some("4Gi".to_string()),
            },
        )]);
        let step_limits = BTreeMap::from([(
            "r".to_string(),
            BTreeMap::from([(
                "tiny".to_string(),
                QuotaOverride {
                    cpu: Some("500m".to_string()),
                    memory: None,
                },
            )]),
        )]);
        manager
            .apply_quota_overrides(&repo_limits, &step_limits)
            .unwrap();

        // Repository ceiling: 4 cores.
        let err = manager
            .validate_resource_request("r", "build", 5.0, 256.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::CpuExceeded { limit, .. } if limit == 4.0));
        manager
            .validate_resource_request("r", "build", 3.0, 256.0)
            .unwrap();

        // Step ceiling: 500m cpu, memory falls back to the step default.
        let err = manager
            .validate_resource_request("r", "tiny", 1.0, 100.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::CpuExceeded { limit, .. } if limit == 0.5));
        let err = manager
            .validate_resource_request("r", "tiny", 0.4, 600.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::MemoryExceeded { limit, .. } if limit == 512.0));
        manager
            .validate_resource_request("r", "tiny", 0.4, 400.0)
            .unwrap();
    }

    #[test]
    fn quota_override_with_bad_spec_is_rejected() {
        let manager = manager_with_global(8.0, 8192.0);
        let repo_limits = BTreeMap::from([(
            "r".to_string(),
            QuotaOverride {
                cpu: Some("fast".to_string()),
                memory: None,
            },
        )]);
        let err = manager
            .apply_quota_overrides(&repo_limits, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidCpu(_)));
        // Nothing was registered for the repository.
        manager
            .validate_resource_request("r", "build", 7.0, 256.0)
            .unwrap();
    }

    #[test]
    fn memory_validation() {
        let manager = manager_with_global(8.0, 1024.0);
        manager
            .validate_resource_request("any", "s", 1.0, 1024.0)
            .unwrap();
        let err = manager
            .validate_resource_request("any", "s", 1.0, 1025.0)
            .unwrap_err();
        assert!(matches!(err, QuotaError::MemoryExceeded { .. }));
    }

    #[test]
    fn history_is_bounded_and_copied() {
        let manager = manager_with_global(8.0, 8192.0);
        for i in 0..10 {
            manager.record_sample(UsageSample {
                timestamp: Utc::now(),
                cpu_percent: i as f32,
                memory_used_mb: 100.0,
                memory_total_mb: 16384.0,
            });
        }
        let history = manager.usage_history();
        assert_eq!(history.len(), 5);
        // Oldest entries were dropped.
        assert_eq!(history[0].cpu_percent, 5.0);
        assert_eq!(history[4].cpu_percent, 9.0);
    }

    #[test]
    fn warning_and_breach_fire_once_per_sample() {
        let manager = Arc::new(manager_with_global(8.0, 1000.0));
        let warnings = Arc::new(AtomicUsize::new(0));
        let breaches = Arc::new(AtomicUsize::new(0));
        {
            let warnings = Arc::clone(&warnings);
            let breaches = Arc::clone(&breaches);
            manager.on_threshold(move |alert| {
                assert_eq!(alert.resource, "memory");
                match alert.kind {
                    AlertKind::Warning => warnings.fetch_add(1, Ordering::SeqCst),
                    AlertKind::Breach => breaches.fetch_add(1, Ordering::SeqCst),
                };
            });
        }

        // 85% of the memory quota: warning.
        manager.record_sample(UsageSample {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_used_mb: 850.0,
            memory_total_mb: 16384.0,
        });
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(breaches.load(Ordering::SeqCst), 0);

        // 110%: breach, and no additional warning.
        manager.record_sample(UsageSample {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_used_mb: 1100.0,
            memory_total_mb: 16384.0,
        });
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(breaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_global_limits_track_host() {
        let limits = default_global_limits();
        assert!(limits.cpu_cores >= 1.0);
        assert_eq!(limits.memory_mb, 4096.0);
    }

    #[tokio::test]
    async fn monitoring_loop_stops_on_cancel() {
        let manager = Arc::new(manager_with_global(8.0, 8192.0));
        let cancel = CancellationToken::new();
        let handle = manager.start_monitoring(cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        // The first immediate tick produced at least one sample.
        assert!(!manager.usage_history().is_empty());
    }
}
