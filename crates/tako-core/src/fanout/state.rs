//! Journaled fan-out state.
//!
//! [`FanOutStateManager`] owns one [`FanOutState`] behind a single mutex;
//! every mutation bumps the monotonic `last_update` and persists the full
//! record to `<workspace>/fanout-states/<id>.json` before returning, so
//! the on-disk journal never lags the in-memory state and writes are never
//! torn (write-new then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tako_types::error::InputError;
use tako_types::fanout::{ChildState, ChildStatus, FanOutState, FanOutStatus};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::subscription::discovery::DiscoveryError;
use crate::subscription::evaluator::EvaluationError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from fan-out execution and state journaling.
#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("fan-out parameter error: {0}")]
    Input(#[from] InputError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("fan-out state persistence failed: {0}")]
    Persist(String),

    #[error("fan-out has no child '{0}'")]
    UnknownChild(String),

    #[error("fan-out canceled")]
    Canceled,
}

// ---------------------------------------------------------------------------
// FanOutStateManager
// ---------------------------------------------------------------------------

/// Mutex-guarded owner of one fan-out record.
pub struct FanOutStateManager {
    path: PathBuf,
    state: Mutex<FanOutState>,
}

impl FanOutStateManager {
    /// Persist the initial record and return the manager.
    pub async fn create(
        states_dir: &Path,
        state: FanOutState,
    ) -> Result<Arc<Self>, FanOutError> {
        std::fs::create_dir_all(states_dir)
            .map_err(|e| FanOutError::Persist(e.to_string()))?;
        let path = states_dir.join(format!("{}.json", state.id));
        persist(&state, &path)?;
        Ok(Arc::new(Self {
            path,
            state: Mutex::new(state),
        }))
    }

    /// Load a persisted record (operator tooling).
    pub fn load(path: &Path) -> Result<FanOutState, FanOutError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| FanOutError::Persist(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| FanOutError::Persist(e.to_string()))
    }

    /// Register a child for `(repository, workflow)`. Children are keyed by
    /// `repository + "-" + workflow`; re-registering the same pair is a
    /// no-op returning the existing key (diamond dedup).
    pub async fn add_child_workflow(
        &self,
        repository: &str,
        workflow: &str,
        inputs: BTreeMap<String, Value>,
    ) -> Result<String, FanOutError> {
        let key = ChildState::key(repository, workflow);
        let mut state = self.state.lock().await;
        if !state.children.contains_key(&key) {
            state.children.insert(
                key.clone(),
                ChildState {
                    repository: repository.to_string(),
                    workflow: workflow.to_string(),
                    inputs,
                    status: ChildStatus::Pending,
                    run_id: None,
                    error: None,
                    started_at: None,
                    completed_at: None,
                },
            );
            self.persist_locked(&mut state)?;
        }
        Ok(key)
    }

    /// Transition the fan-out status.
    pub async fn set_status(&self, status: FanOutStatus) -> Result<(), FanOutError> {
        let mut state = self.state.lock().await;
        state.status = status;
        self.persist_locked(&mut state)
    }

    /// `running -> waiting`: children are launched, awaiting terminals.
    pub async fn start_waiting(&self) -> Result<(), FanOutError> {
        self.set_status(FanOutStatus::Waiting).await
    }

    /// Terminal transition with completion stamp.
    pub async fn finish(
        &self,
        status: FanOutStatus,
        error: Option<String>,
    ) -> Result<(), FanOutError> {
        let mut state = self.state.lock().await;
        state.status = status;
        state.error = error;
        state.completed_at = Some(Utc::now());
        self.persist_locked(&mut state)
    }

    /// First-wins idempotency mark. Returns `true` when this call set the
    /// run id; `false` when the pair was already triggered (the stored run
    /// id is never overwritten).
    pub async fn mark_workflow_triggered(
        &self,
        repository: &str,
        workflow: &str,
        run_id: &str,
    ) -> Result<bool, FanOutError> {
        let key = ChildState::trigger_key(repository, workflow);
        let mut state = self.state.lock().await;
        if state.triggered.contains_key(&key) {
            return Ok(false);
        }
        state.triggered.insert(key, run_id.to_string());
        self.persist_locked(&mut state)?;
        Ok(true)
    }

    /// The stored run id for a triggered pair, if any.
    pub async fn is_workflow_triggered(
        &self,
        repository: &str,
        workflow: &str,
    ) -> Option<String> {
        let key = ChildState::trigger_key(repository, workflow);
        self.state.lock().await.triggered.get(&key).cloned()
    }

    /// Mark a child as launched.
    pub async fn update_child_running(
        &self,
        child_key: &str,
        run_id: &str,
    ) -> Result<(), FanOutError> {
        let mut state = self.state.lock().await;
        let child = state
            .children
            .get_mut(child_key)
            .ok_or_else(|| FanOutError::UnknownChild(child_key.to_string()))?;
        if child.status.is_terminal() {
            return Ok(());
        }
        child.status = ChildStatus::Running;
        child.run_id = Some(run_id.to_string());
        child.started_at = Some(Utc::now());
        self.persist_locked(&mut state)
    }

    /// Record a child's terminal status. A child already in a terminal
    /// state keeps it: each child reaches exactly one terminal state.
    pub async fn update_child_status(
        &self,
        child_key: &str,
        status: ChildStatus,
        run_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), FanOutError> {
        let mut state = self.state.lock().await;
        let child = state
            .children
            .get_mut(child_key)
            .ok_or_else(|| FanOutError::UnknownChild(child_key.to_string()))?;
        if child.status.is_terminal() {
            return Ok(());
        }
        child.status = status;
        if run_id.is_some() {
            child.run_id = run_id;
        }
        child.error = error;
        if status.is_terminal() {
            child.completed_at = Some(Utc::now());
        }
        self.persist_locked(&mut state)
    }

    /// Mark every non-terminal child with `status` and the given reason.
    pub async fn close_pending_children(
        &self,
        status: ChildStatus,
        reason: &str,
    ) -> Result<(), FanOutError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for child in state.children.values_mut() {
            if !child.status.is_terminal() {
                child.status = status;
                child.error = Some(reason.to_string());
                child.completed_at = Some(now);
            }
        }
        self.persist_locked(&mut state)
    }

    /// A point-in-time copy of the record.
    pub async fn snapshot(&self) -> FanOutState {
        self.state.lock().await.clone()
    }

    fn persist_locked(&self, state: &mut FanOutState) -> Result<(), FanOutError> {
        state.touch();
        persist(state, &self.path)
    }
}

/// Atomic write-new-then-rename of the record.
fn persist(state: &FanOutState, path: &Path) -> Result<(), FanOutError> {
    let json =
        serde_json::to_vec_pretty(state).map_err(|e| FanOutError::Persist(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| FanOutError::Persist(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| FanOutError::Persist(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> Arc<FanOutStateManager> {
        FanOutStateManager::create(
            dir.path(),
            FanOutState::new(
                "exec-20250314-093015-deadbeef-announce",
                "exec-20250314-093015-deadbeef",
                "ex/lib",
                "build_completed",
                true,
                None,
            ),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn creation_persists_initial_record() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let on_disk = FanOutStateManager::load(
            &dir.path().join("exec-20250314-093015-deadbeef-announce.json"),
        )
        .unwrap();
        assert_eq!(on_disk.status, FanOutStatus::Pending);
        assert_eq!(on_disk.source_repo, "ex/lib");
        drop(mgr);
    }

    #[tokio::test]
    async fn add_child_is_idempotent_per_pair() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let key1 = mgr
            .add_child_workflow("ex/a", "update", BTreeMap::new())
            .await
            .unwrap();
        let key2 = mgr
            .add_child_workflow("ex/a", "update", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(key1, "ex/a-update");
        assert_eq!(key1, key2);
        assert_eq!(mgr.snapshot().await.children.len(), 1);
    }

    #[tokio::test]
    async fn mark_triggered_is_first_wins() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        assert!(mgr
            .mark_workflow_triggered("ex/a", "update", "run-first")
            .await
            .unwrap());
        assert!(!mgr
            .mark_workflow_triggered("ex/a", "update", "run-second")
            .await
            .unwrap());
        assert_eq!(
            mgr.is_workflow_triggered("ex/a", "update").await.as_deref(),
            Some("run-first")
        );
    }

    #[tokio::test]
    async fn child_transitions_persist() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let key = mgr
            .add_child_workflow("ex/a", "update", BTreeMap::new())
            .await
            .unwrap();

        mgr.update_child_running(&key, "child-run-1").await.unwrap();
        mgr.update_child_status(&key, ChildStatus::Completed, None, None)
            .await
            .unwrap();

        let on_disk = FanOutStateManager::load(
            &dir.path().join("exec-20250314-093015-deadbeef-announce.json"),
        )
        .unwrap();
        let child = &on_disk.children[&key];
        assert_eq!(child.status, ChildStatus::Completed);
        assert_eq!(child.run_id.as_deref(), Some("child-run-1"));
        assert!(child.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_child_is_error() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let err = mgr
            .update_child_running("ex/ghost-update", "run")
            .await
            .unwrap_err();
        assert!(matches!(err, FanOutError::UnknownChild(_)));
    }

    #[tokio::test]
    async fn close_pending_children_marks_non_terminal_only() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let done = mgr
            .add_child_workflow("ex/a", "update", BTreeMap::new())
            .await
            .unwrap();
        let stuck = mgr
            .add_child_workflow("ex/b", "update", BTreeMap::new())
            .await
            .unwrap();
        mgr.update_child_status(&done, ChildStatus::Completed, None, None)
            .await
            .unwrap();

        mgr.close_pending_children(ChildStatus::TimedOut, "fan-out timed out")
            .await
            .unwrap();

        let snapshot = mgr.snapshot().await;
        assert_eq!(snapshot.children[&done].status, ChildStatus::Completed);
        assert_eq!(snapshot.children[&stuck].status, ChildStatus::TimedOut);
        assert_eq!(
            snapshot.children[&stuck].error.as_deref(),
            Some("fan-out timed out")
        );
    }

    #[tokio::test]
    async fn last_update_is_monotonic_across_mutations() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let mut previous = mgr.snapshot().await.last_update;
        for status in [
            FanOutStatus::Running,
            FanOutStatus::Waiting,
            FanOutStatus::Completed,
        ] {
            mgr.set_status(status).await.unwrap();
            let current = mgr.snapshot().await.last_update;
            assert!(current > previous);
            previous = current;
        }
    }
}
