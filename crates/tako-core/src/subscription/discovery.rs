//! Subscription discovery over the repository cache.
//!
//! The cache layout is `<cache>/repos/<owner>/<repo>/<branch>/`; discovery
//! walks the `main` branch of every cached repository, loads its `tako.yml`,
//! and collects subscriptions matching an `(artifact, event type)` pair.
//! Results are sorted by repository name so independent runs over the same
//! cache see the same order.

use std::future::Future;
use std::path::PathBuf;

use tako_types::error::InputError;
use tako_types::subscription::SubscriptionMatch;
use thiserror::Error;

use crate::config::{self, CONFIG_FILE};

/// Branch consulted during discovery.
pub const DISCOVERY_BRANCH: &str = "main";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from subscription discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery parameter: {0}")]
    Input(#[from] InputError),

    #[error("discovery canceled")]
    Canceled,

    #[error("cache walk failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Capability contract for subscription discovery.
pub trait SubscriptionDiscoverer: Send + Sync {
    /// All subscriptions in the cache matching `(artifact, event_type)`,
    /// sorted by repository name.
    fn find_subscribers(
        &self,
        artifact: &str,
        event_type: &str,
    ) -> impl Future<Output = Result<Vec<SubscriptionMatch>, DiscoveryError>> + Send;
}

// ---------------------------------------------------------------------------
// CacheDiscoverer
// ---------------------------------------------------------------------------

/// Discoverer walking `<cache>/repos/*/*/main/tako.yml`.
#[derive(Debug, Clone)]
pub struct CacheDiscoverer {
    cache_dir: PathBuf,
}

impl CacheDiscoverer {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    fn collect(
        &self,
        artifact: &str,
        event_type: &str,
    ) -> Result<Vec<SubscriptionMatch>, DiscoveryError> {
        let repos_root = self.cache_dir.join("repos");
        let mut matches = Vec::new();

        let owners = match std::fs::read_dir(&repos_root) {
            Ok(entries) => entries,
            // An empty cache yields an empty result, not an error.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(matches),
            Err(err) => return Err(DiscoveryError::Io(err)),
        };

        for owner_entry in owners.flatten() {
            if !owner_entry.path().is_dir() {
                continue;
            }
            let owner = owner_entry.file_name().to_string_lossy().to_string();
            let repos = match std::fs::read_dir(owner_entry.path()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for repo_entry in repos.flatten() {
                let repo_path = repo_entry.path().join(DISCOVERY_BRANCH);
                if !repo_path.join(CONFIG_FILE).is_file() {
                    continue;
                }
                let repository =
                    format!("{owner}/{}", repo_entry.file_name().to_string_lossy());

                let repo_config = match config::load_repo_config(&repo_path) {
                    Ok(repo_config) => repo_config,
                    Err(err) => {
                        // One malformed repository must not poison the walk.
                        tracing::warn!(
                            repository = repository.as_str(),
                            %err,
                            "skipping repository with unloadable tako.yml"
                        );
                        continue;
                    }
                };

                for subscription in repo_config.subscriptions {
                    if subscription.artifact == artifact
                        && subscription.events.iter().any(|e| e == event_type)
                    {
                        matches.push(SubscriptionMatch {
                            repository: repository.clone(),
                            repo_path: repo_path.clone(),
                            subscription,
                        });
                    }
                }
            }
        }

        matches.sort_by(|a, b| a.repository.cmp(&b.repository));
        Ok(matches)
    }
}

impl SubscriptionDiscoverer for CacheDiscoverer {
    async fn find_subscribers(
        &self,
        artifact: &str,
        event_type: &str,
    ) -> Result<Vec<SubscriptionMatch>, DiscoveryError> {
        if artifact.is_empty() {
            return Err(InputError::Empty("artifact".to_string()).into());
        }
        if event_type.is_empty() {
            return Err(InputError::Empty("event_type".to_string()).into());
        }
        self.collect(artifact, event_type)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
