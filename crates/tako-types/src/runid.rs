//! Run identity: generation, parsing, and validation of run identifiers.
//!
//! A run ID names one top-level orchestrator invocation and has the fixed
//! shape `exec-YYYYMMDD-HHMMSS-<8 hex>` (29 characters, UTC). Child
//! executions derive scoped identifiers from their parent's run ID; scoped
//! identifiers are plain strings and intentionally do not round-trip
//! through [`RunId::parse`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed length of a canonical run ID.
pub const RUN_ID_LEN: usize = 29;

fn run_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^exec-[0-9]{8}-[0-9]{6}-[0-9a-f]{8}$").expect("run id regex is valid")
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced when parsing run identifiers.
#[derive(Debug, thiserror::Error)]
pub enum RunIdError {
    #[error("run id '{0}' does not match exec-YYYYMMDD-HHMMSS-xxxxxxxx")]
    Malformed(String),

    #[error("run id '{id}' carries an invalid timestamp: {reason}")]
    BadTimestamp { id: String, reason: String },
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A validated run identifier.
///
/// Generated once per top-level invocation via [`RunId::generate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run ID from the current UTC time and uuid entropy.
    pub fn generate() -> Self {
        let now = Utc::now();
        let entropy = Uuid::new_v4().simple().to_string();
        Self(format!(
            "exec-{}-{}",
            now.format("%Y%m%d-%H%M%S"),
            &entropy[..8]
        ))
    }

    /// Membership test for the canonical run-ID format.
    pub fn is_valid(candidate: &str) -> bool {
        candidate.len() == RUN_ID_LEN && run_id_regex().is_match(candidate)
    }

    /// Parse a run ID into its UTC timestamp and 8-char hex hash.
    pub fn parse(candidate: &str) -> Result<(NaiveDateTime, String), RunIdError> {
        if !Self::is_valid(candidate) {
            return Err(RunIdError::Malformed(candidate.to_string()));
        }
        // exec-YYYYMMDD-HHMMSS-hhhhhhhh
        let stamp = &candidate[5..20];
        let hash = &candidate[21..];
        let timestamp = NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S").map_err(|e| {
            RunIdError::BadTimestamp {
                id: candidate.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok((timestamp, hash.to_string()))
    }

    /// The run ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scoped identifier for a subscriber child execution.
    ///
    /// The repository's `/` separator is flattened so the result stays
    /// filesystem-safe.
    pub fn subscriber_scope(&self, repository: &str) -> String {
        format!("{}-subscriber-{}", self.0, repository.replace('/', "-"))
    }

    /// Scoped identifier for a directed-dependent child execution.
    pub fn dependent_scope(&self, repository: &str) -> String {
        format!("{}-dependent-{}", self.0, repository.replace('/', "-"))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(RunIdError::Malformed(s.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
