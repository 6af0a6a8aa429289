//! Fan-out state: the durable record of one event's translation into child
//! workflow executions.
//!
//! A [`FanOutState`] is journaled to disk on every mutation; `last_update`
//! is monotonically non-decreasing so external observers can order
//! snapshots. Children are keyed by `repository + "-" + workflow`; the
//! `triggered` idempotency map is keyed `repository + "|" + workflow`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a fan-out execution.
///
/// `pending -> running -> waiting -> {completed | failed | timed_out}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    TimedOut,
}

impl FanOutStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for FanOutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single child workflow execution.
///
/// Canceled children are recorded as `Failed` with the cancellation reason
/// in `error`, preserving the status-partition invariant
/// (`pending + running + completed + failed + timed_out == children`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ChildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

// ---------------------------------------------------------------------------
// ChildState
// ---------------------------------------------------------------------------

/// Durable record of one child workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildState {
    /// Subscribing repository (`owner/repo`).
    pub repository: String,
    /// Workflow triggered in the subscriber.
    pub workflow: String,
    /// Computed inputs passed to the child.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Current status.
    pub status: ChildStatus,
    /// Scoped run id assigned when the child launches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChildState {
    /// The canonical child key: `repository + "-" + workflow`.
    pub fn key(repository: &str, workflow: &str) -> String {
        format!("{repository}-{workflow}")
    }

    /// The idempotency key: `repository + "|" + workflow`.
    pub fn trigger_key(repository: &str, workflow: &str) -> String {
        format!("{repository}|{workflow}")
    }
}

// ---------------------------------------------------------------------------
// FanOutState
// ---------------------------------------------------------------------------

/// Durable record of a fan-out execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutState {
    /// Fan-out id, unique within the parent run.
    pub id: String,
    /// The run that executed the fan-out step.
    pub parent_run_id: String,
    /// Repository that emitted the event (`owner/repo`).
    pub source_repo: String,
    /// Event type fanned out.
    pub event_type: String,
    pub status: FanOutStatus,
    /// When true, child failures are aggregated after all children reach a
    /// terminal state; when false, the first failure fails the fan-out.
    pub wait_for_all: bool,
    /// Optional overall timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Children keyed by `repository + "-" + workflow`.
    #[serde(default)]
    pub children: BTreeMap<String, ChildState>,
    /// Idempotency journal: `repository + "|" + workflow` -> run id.
    #[serde(default)]
    pub triggered: BTreeMap<String, String>,
    /// Monotonically non-decreasing mutation stamp.
    pub last_update: DateTime<Utc>,
}

impl FanOutState {
    /// Fresh pending state for a fan-out that has not yet discovered
    /// subscribers.
    pub fn new(
        id: impl Into<String>,
        parent_run_id: impl Into<String>,
        source_repo: impl Into<String>,
        event_type: impl Into<String>,
        wait_for_all: bool,
        timeout_secs: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_run_id: parent_run_id.into(),
            source_repo: source_repo.into(),
            event_type: event_type.into(),
            status: FanOutStatus::Pending,
            wait_for_all,
            timeout_secs,
            started_at: now,
            completed_at: None,
            error: None,
            children: BTreeMap::new(),
            triggered: BTreeMap::new(),
            last_update: now,
        }
    }

    /// Whether the fan-out has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Advance `last_update`, never moving it backwards even if the wall
    /// clock does.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_update = if now > self.last_update {
            now
        } else {
            self.last_update + ChronoDuration::microseconds(1)
        };
    }

    /// Count children currently in `status`.
    pub fn count_children(&self, status: ChildStatus) -> usize {
        self.children.values().filter(|c| c.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
