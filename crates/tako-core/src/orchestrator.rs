//! The discovery orchestrator: validated, deterministic subscription
//! discovery over a [`SubscriptionDiscoverer`] port.
//!
//! Validation failures are surfaced without ever invoking the discoverer.
//! Hybrid directed-plus-event propagation is a separate concern (see
//! `graph`); this orchestrator only resolves event subscribers.

use tako_types::error::InputError;
use tako_types::subscription::{Artifact, SubscriptionMatch};
use tokio_util::sync::CancellationToken;

use crate::subscription::discovery::{DiscoveryError, SubscriptionDiscoverer};

/// Orchestrates subscription discovery with validation, optional filtering
/// of disabled entries, and deterministic prioritisation.
pub struct Orchestrator<D: SubscriptionDiscoverer> {
    discoverer: D,
    drop_disabled: bool,
    prioritize: bool,
}

impl<D: SubscriptionDiscoverer> Orchestrator<D> {
    pub fn new(discoverer: D, drop_disabled: bool, prioritize: bool) -> Self {
        Self {
            discoverer,
            drop_disabled,
            prioritize,
        }
    }

    /// Discover subscriptions for `(artifact, event_type)`.
    ///
    /// Results are sorted by `(repository, workflow)` when prioritisation
    /// is enabled, so two independent runs over the same cache see the
    /// same order.
    pub async fn discover_subscriptions(
        &self,
        cancel: &CancellationToken,
        artifact: &str,
        event_type: &str,
    ) -> Result<Vec<SubscriptionMatch>, DiscoveryError> {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Canceled);
        }
        if artifact.trim().is_empty() {
            return Err(InputError::Empty("artifact".to_string()).into());
        }
        if let Err(err) = artifact.parse::<Artifact>() {
            return Err(InputError::Invalid {
                name: "artifact".to_string(),
                reason: err.to_string(),
            }
            .into());
        }
        if event_type.trim().is_empty() {
            return Err(InputError::Empty("event_type".to_string()).into());
        }

        let mut matches = self
            .discoverer
            .find_subscribers(artifact, event_type)
            .await?;

        if self.drop_disabled {
            matches.retain(|m| !m.subscription.disabled);
        }
        if self.prioritize {
            matches.sort_by(|a, b| {
                (a.repository.as_str(), a.subscription.workflow.as_str())
                    .cmp(&(b.repository.as_str(), b.subscription.workflow.as_str()))
            });
        }

        tracing::debug!(
            artifact,
            event_type,
            matches = matches.len(),
            "discovered subscriptions"
        );
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tako_types::subscription::Subscription;

    /// In-memory discoverer returning canned matches.
    struct FixedDiscoverer {
        matches: Vec<SubscriptionMatch>,
    }

    impl SubscriptionDiscoverer for FixedDiscoverer {
        async fn find_subscribers(
            &self,
            _artifact: &str,
            _event_type: &str,
        ) -> Result<Vec<SubscriptionMatch>, DiscoveryError> {
            Ok(self.matches.clone())
        }
    }

    fn sub_match(repository: &str, workflow: &str, disabled: bool) -> SubscriptionMatch {
        SubscriptionMatch {
            repository: repository.to_string(),
            repo_path: PathBuf::from(format!("/cache/repos/{repository}/main")),
            subscription: Subscription {
                artifact: "ex/lib:default".to_string(),
                events: vec!["build_completed".to_string()],
                schema_version: None,
                filters: Vec::new(),
                inputs: BTreeMap::new(),
                workflow: workflow.to_string(),
                disabled,
            },
        }
    }

    #[tokio::test]
    async fn validates_before_delegating() {
        let orchestrator = Orchestrator::new(FixedDiscoverer { matches: vec![] }, true, true);
        let cancel = CancellationToken::new();

        assert!(matches!(
            orchestrator
                .discover_subscriptions(&cancel, "", "build_completed")
                .await,
            Err(DiscoveryError::Input(_))
        ));
        assert!(matches!(
            orchestrator
                .discover_subscriptions(&cancel, "ex/lib:default", "  ")
                .await,
            Err(DiscoveryError::Input(_))
        ));
        assert!(matches!(
            orchestrator
                .discover_subscriptions(&cancel, "not-an-artifact", "build_completed")
                .await,
            Err(DiscoveryError::Input(_))
        ));
    }

    #[tokio::test]
    async fn canceled_context_short_circuits() {
        let orchestrator = Orchestrator::new(FixedDiscoverer { matches: vec![] }, true, true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            orchestrator
                .discover_subscriptions(&cancel, "ex/lib:default", "build_completed")
                .await,
            Err(DiscoveryError::Canceled)
        ));
    }

    #[tokio::test]
    async fn drops_disabled_and_sorts() {
        let orchestrator = Orchestrator::new(
            FixedDiscoverer {
                matches: vec![
                    sub_match("ex/b", "update", false),
                    sub_match("ex/a", "zeta", false),
                    sub_match("ex/a", "alpha", false),
                    sub_match("ex/c", "update", true),
                ],
            },
            true,
            true,
        );
        let cancel = CancellationToken::new();
        let matches = orchestrator
            .discover_subscriptions(&cancel, "ex/lib:default", "build_completed")
            .await
            .unwrap();

        let order: Vec<(String, String)> = matches
            .iter()
            .map(|m| (m.repository.clone(), m.subscription.workflow.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("ex/a".to_string(), "alpha".to_string()),
                ("ex/a".to_string(), "zeta".to_string()),
                ("ex/b".to_string(), "update".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn keeps_disabled_when_filtering_off() {
        let orchestrator = Orchestrator::new(
            FixedDiscoverer {
                matches: vec![sub_match("ex/c", "update", true)],
            },
            false,
            false,
        );
        let cancel = CancellationToken::new();
        let matches = orchestrator
            .discover_subscriptions(&cancel, "ex/lib:default", "build_completed")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }
}
