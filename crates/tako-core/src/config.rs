//! `tako.yml` loading and structural validation.
//!
//! The engine consumes already-parsed [`RepoConfig`] structures; this module
//! is the narrow loader that produces them from a repository checkout and
//! enforces the structural constraints serde cannot express.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tako_types::workflow::RepoConfig;
use thiserror::Error;

/// File name looked up at a repository root.
pub const CONFIG_FILE: &str = "tako.yml";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading or validating `tako.yml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tako.yml not found at {0}")]
    Missing(PathBuf),

    #[error("tako.yml at {path} failed to parse: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("tako.yml invalid: {0}")]
    Invalid(String),

    #[error("I/O error reading tako.yml: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate the `tako.yml` of the repository at `repo_path`.
pub fn load_repo_config(repo_path: &Path) -> Result<RepoConfig, ConfigError> {
    let path = repo_path.join(CONFIG_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::Missing(path));
        }
        Err(err) => return Err(ConfigError::Io(err)),
    };
    let config = RepoConfig::from_yaml(&text).map_err(|e| ConfigError::Parse {
        path,
        reason: e.to_string(),
    })?;
    validate_repo_config(&config)?;
    Ok(config)
}

/// Structural validation of a parsed configuration.
///
/// Checks, per workflow:
/// - at least one step, unique step ids;
/// - exactly one execution mode per step (`uses` | `image` | `run`),
///   where container steps may also carry `run`.
pub fn validate_repo_config(config: &RepoConfig) -> Result<(), ConfigError> {
    for (name, workflow) in &config.workflows {
        if workflow.steps.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "workflow '{name}' has no steps"
            )));
        }

        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if step.id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "workflow '{name}' has a step with an empty id"
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "workflow '{name}' has duplicate step id '{}'",
                    step.id
                )));
            }

            match (&step.uses, &step.image, &step.run) {
                (Some(_), None, None) => {}
                (Some(_), _, _) => {
                    return Err(ConfigError::Invalid(format!(
                        "step '{}' in workflow '{name}' combines 'uses' with 'run' or 'image'",
                        step.id
                    )));
                }
                (None, Some(_), _) => {}
                (None, None, Some(_)) => {}
                (None, None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "step '{}' in workflow '{name}' declares none of 'run', 'image', 'uses'",
                        step.id
                    )));
                }
            }
        }
    }

    for sub in &config.subscriptions {
        if sub.artifact.is_empty() {
            return Err(ConfigError::Invalid(
                "subscription with empty artifact".to_string(),
            ));
        }
        if sub.workflow.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "subscription to '{}' names no workflow",
                sub.artifact
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
