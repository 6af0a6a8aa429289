//! Subscription declarations and artifact identifiers.
//!
//! A subscription is a repository's reaction to typed events emitted by
//! another repository: it names the producing artifact, the event types it
//! cares about, an optional schema-version range, filter expressions, input
//! templates, and the local workflow to run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A single subscription entry from `tako.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Producing artifact, `owner/repo:name`.
    pub artifact: String,
    /// Event types this subscription reacts to (exact string match).
    #[serde(default)]
    pub events: Vec<String>,
    /// Optional semver range the event's schema version must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Filter expressions over `{payload, event_type, event_source}`;
    /// all must evaluate to true.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    /// Input templates for the triggered workflow, expanded with
    /// `{payload, event}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    /// Workflow to run in the subscribing repository.
    pub workflow: String,
    /// Disabled subscriptions are dropped by the orchestrator.
    #[serde(default)]
    pub disabled: bool,
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Errors from artifact-id parsing.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact '{0}' is not of the form owner/repo:name")]
    Malformed(String),
}

/// A parsed `owner/repo:name` artifact identifier.
///
/// The `:name` suffix is optional in the textual form and defaults to
/// `default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub owner: String,
    pub repo: String,
    pub name: String,
}

impl Artifact {
    /// The `owner/repo` repository part.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl FromStr for Artifact {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo_part, name) = match s.split_once(':') {
            Some((repo_part, name)) if !name.is_empty() => (repo_part, name.to_string()),
            Some(_) => return Err(ArtifactError::Malformed(s.to_string())),
            None => (s, "default".to_string()),
        };
        let (owner, repo) = repo_part
            .split_once('/')
            .ok_or_else(|| ArtifactError::Malformed(s.to_string()))?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(ArtifactError::Malformed(s.to_string()));
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            name,
        })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.owner, self.repo, self.name)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionMatch
// ---------------------------------------------------------------------------

/// A subscription discovered for a given `(artifact, event type)` pair,
/// before evaluator filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMatch {
    /// Subscribing repository (`owner/repo`).
    pub repository: String,
    /// Path to the subscribing repository's checkout in the cache.
    pub repo_path: PathBuf,
    /// The matching subscription entry.
    pub subscription: Subscription,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_parse_full_form() {
        let artifact: Artifact = "ex/lib:default".parse().unwrap();
        assert_eq!(artifact.owner, "ex");
        assert_eq!(artifact.repo, "lib");
        assert_eq!(artifact.name, "default");
        assert_eq!(artifact.repository(), "ex/lib");
        assert_eq!(artifact.to_string(), "ex/lib:default");
    }

    #[test]
    fn artifact_parse_defaults_name() {
        let artifact: Artifact = "ex/lib".parse().unwrap();
        assert_eq!(artifact.name, "default");
    }

    #[test]
    fn artifact_parse_rejects_malformed() {
        for bad in ["", "nolslash", "/repo:x", "owner/:x", "a/b/c:x", "a/b:"] {
            assert!(bad.parse::<Artifact>().is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn subscription_yaml_parse() {
        let yaml = r#"
artifact: ex/lib:default
events: [build_completed, release_created]
schema_version: "^1.1.0"
filters:
  - "payload.status == 'success'"
inputs:
  version: "{{ event.payload.version }}"
workflow: update
"#;
        let sub: Subscription = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(sub.artifact, "ex/lib:default");
        assert_eq!(sub.events.len(), 2);
        assert_eq!(sub.schema_version.as_deref(), Some("^1.1.0"));
        assert_eq!(sub.filters.len(), 1);
        assert_eq!(sub.workflow, "update");
        assert!(!sub.disabled);
    }

    #[test]
    fn subscription_minimal_defaults() {
        let sub: Subscription =
            serde_yaml_ng::from_str("artifact: ex/lib:default\nworkflow: update\n").unwrap();
        assert!(sub.events.is_empty());
        assert!(sub.schema_version.is_none());
        assert!(sub.filters.is_empty());
        assert!(sub.inputs.is_empty());
    }
}
