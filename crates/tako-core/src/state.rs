//! Per-run durable execution state.
//!
//! One [`ExecutionState`] exists per run, owned by the runner executing that
//! run; external observers may read the file at any time. Every write is
//! atomic (write to a temp file, then rename) so readers never see a torn
//! record. Steps append monotonically and each step ends in exactly one
//! terminal state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from execution-state persistence.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no state recorded for run '{0}'")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Record of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    /// Extracted step outputs (name -> value).
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The durable record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub workflow: String,
    /// Path of the source repository checkout.
    pub source_repo: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    pub phase: ExecutionPhase,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    /// Fresh pending state for a run about to start.
    pub fn new(
        run_id: impl Into<String>,
        workflow: impl Into<String>,
        source_repo: impl Into<String>,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow: workflow.into(),
            source_repo: source_repo.into(),
            inputs,
            phase: ExecutionPhase::Pending,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Append a completed step record. Steps only ever append; the record
    /// must already be terminal (`completed_at` set).
    pub fn record_step(&mut self, record: StepRecord) {
        debug_assert!(record.completed_at.is_some());
        self.steps.push(record);
    }

    /// Move to a terminal phase, stamping the completion time.
    pub fn finish(&mut self, phase: ExecutionPhase, error: Option<String>) {
        self.phase = phase;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// ExecutionStateStore
// ---------------------------------------------------------------------------

/// Filesystem store for execution states, rooted at `<workspace>/state/`.
#[derive(Debug, Clone)]
pub struct ExecutionStateStore {
    state_dir: PathBuf,
}

impl ExecutionStateStore {
    /// Create the store, ensuring `<workspace>/state/` exists.
    pub fn new(workspace: &Path) -> Result<Self, StateError> {
        let state_dir = workspace.join("state");
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self { state_dir })
    }

    /// Path of the state file for `run_id`.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(format!("{run_id}.json"))
    }

    /// Atomically persist a state snapshot.
    pub fn save(&self, state: &ExecutionState) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state)?;
        let target = self.path_for(&state.run_id);
        let tmp = self.state_dir.join(format!(".{}.tmp", state.run_id));
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Load the persisted state for `run_id`.
    pub fn load(&self, run_id: &str) -> Result<ExecutionState, StateError> {
        let path = self.path_for(run_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(run_id.to_string()));
            }
            Err(err) => return Err(StateError::Io(err)),
        };
        Ok(serde_json::from_str(&text)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> ExecutionState {
        ExecutionState::new(
            "exec-20250314-093015-deadbeef",
            "build",
            "/cache/repos/ex/lib/main",
            BTreeMap::from([("tag".to_string(), Value::String("latest".into()))]),
        )
    }

    #[test]
    fn save_and_load_roundtrip() {
        let workspace = TempDir::new().unwrap();
        let store = ExecutionStateStore::new(workspace.path()).unwrap();

        let mut state = sample_state();
        state.phase = ExecutionPhase::Running;
        store.save(&state).unwrap();

        let loaded = store.load(&state.run_id).unwrap();
        assert_eq!(loaded.workflow, "build");
        assert_eq!(loaded.phase, ExecutionPhase::Running);
        assert_eq!(loaded.inputs["tag"], Value::String("latest".into()));
    }

    #[test]
    fn load_missing_run_is_not_found() {
        let workspace = TempDir::new().unwrap();
        let store = ExecutionStateStore::new(workspace.path()).unwrap();
        let err = store.load("exec-20250314-093015-00000000").unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn steps_append_in_order() {
        let mut state = sample_state();
        for (i, success) in [(0, true), (1, true), (2, false)] {
            let now = Utc::now();
            state.record_step(StepRecord {
                id: format!("step-{i}"),
                started_at: now,
                completed_at: Some(now),
                success,
                stdout: String::new(),
                outputs: BTreeMap::new(),
                error: if success { None } else { Some("boom".into()) },
            });
        }
        assert_eq!(state.steps.len(), 3);
        assert_eq!(state.steps[2].id, "step-2");
        assert!(!state.steps[2].success);
    }

    #[test]
    fn completion_time_not_before_start() {
        let mut state = sample_state();
        state.finish(ExecutionPhase::Completed, None);
        assert!(state.completed_at.unwrap() >= state.started_at);
        assert_eq!(state.phase, ExecutionPhase::Completed);
    }

    #[test]
    fn save_overwrites_atomically() {
        let workspace = TempDir::new().unwrap();
        let store = ExecutionStateStore::new(workspace.path()).unwrap();

        let mut state = sample_state();
        store.save(&state).unwrap();
        state.finish(ExecutionPhase::Failed, Some("step 'compile' failed".into()));
        store.save(&state).unwrap();

        let loaded = store.load(&state.run_id).unwrap();
        assert_eq!(loaded.phase, ExecutionPhase::Failed);
        assert_eq!(loaded.error.as_deref(), Some("step 'compile' failed"));

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(workspace.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
