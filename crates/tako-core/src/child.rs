//! Per-child workspace isolation.
//!
//! The factory creates one isolated workspace per child under
//! `<parent>/children/<unique>`, hands out a runner bound to it, and
//! bounds concurrent children with a counting semaphore
//! (`max_concurrent_repos`). Cache read/write locks are lent through the
//! factory so children never talk to the lock manager directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tako_types::lock::LockType;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lock::LockError;
use crate::runner::{BoxWorkflowRunner, EngineShared, Runner};
use crate::subscription::discovery::SubscriptionDiscoverer;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from child workspace creation.
#[derive(Debug, Error)]
pub enum ChildFactoryError {
    #[error("child runner factory is closed")]
    Closed,

    #[error("child workspace creation failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// ChildRunnerFactory
// ---------------------------------------------------------------------------

/// A child runner bound to its isolated workspace. The semaphore permit is
/// held for the child's lifetime, bounding concurrent children.
pub struct ChildRunner {
    pub runner: BoxWorkflowRunner,
    pub workspace: PathBuf,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ChildRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRunner")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// Creates isolated child runners sharing the parent's engine references.
pub struct ChildRunnerFactory<D: SubscriptionDiscoverer + 'static> {
    shared: Arc<EngineShared<D>>,
    parent_workspace: PathBuf,
    dry_run: bool,
    semaphore: Arc<Semaphore>,
    counter: AtomicU64,
    closed: AtomicBool,
}

impl<D: SubscriptionDiscoverer + 'static> ChildRunnerFactory<D> {
    pub fn new(
        shared: Arc<EngineShared<D>>,
        parent_workspace: PathBuf,
        dry_run: bool,
    ) -> Self {
        let permits = shared.settings.max_concurrent_repos.max(1);
        Self {
            shared,
            parent_workspace,
            dry_run,
            semaphore: Arc::new(Semaphore::new(permits)),
            counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Create an isolated child runner for `child_run_id`.
    ///
    /// Waits on the factory semaphore when `max_concurrent_repos` children
    /// are already alive. Workspace names are unique per factory.
    pub async fn create_child_runner(
        &self,
        child_run_id: &str,
    ) -> Result<ChildRunner, ChildFactoryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChildFactoryError::Closed);
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ChildFactoryError::Closed)?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(ChildFactoryError::Closed);
        }

        let serial = self.counter.fetch_add(1, Ordering::SeqCst);
        let entropy = Uuid::new_v4().simple().to_string();
        let workspace = self
            .parent_workspace
            .join("children")
            .join(format!("child-{serial}-{}", &entropy[..8]));
        std::fs::create_dir_all(&workspace)?;

        let runner = Runner::scoped(
            Arc::clone(&self.shared),
            workspace.clone(),
            child_run_id.to_string(),
            self.dry_run,
        );

        tracing::debug!(
            child_run_id,
            workspace = %workspace.display(),
            "created child runner"
        );
        Ok(ChildRunner {
            runner: BoxWorkflowRunner::new(runner),
            workspace,
            _permit: permit,
        })
    }

    /// Lend a cache lock to a child (delegates to the shared lock manager).
    pub async fn acquire_cache_lock(
        &self,
        cancel: &CancellationToken,
        run_id: &str,
        repository: &str,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        self.shared
            .lock_manager
            .acquire_lock_with_timeout(
                cancel,
                run_id,
                repository,
                lock_type,
                Duration::from_secs(self.shared.settings.lock_timeout_secs),
            )
            .await
    }

    /// Return a lent cache lock.
    pub fn release_cache_lock(
        &self,
        run_id: &str,
        repository: &str,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        self.shared
            .lock_manager
            .release_lock(run_id, repository, lock_type)
    }

    /// Stop handing out child runners. In-flight children are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tako_types::config::GlobalConfig;
    use tempfile::TempDir;

    fn shared(workspace: &TempDir, cache: &TempDir, max_children: usize) -> Arc<EngineShared<crate::subscription::discovery::CacheDiscoverer>> {
        let settings = GlobalConfig {
            max_concurrent_repos: max_children,
            ..GlobalConfig::default()
        };
        EngineShared::bootstrap(
            workspace.path(),
            cache.path().to_path_buf(),
            settings,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn child_workspaces_are_unique() {
        let workspace = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let factory = ChildRunnerFactory::new(
            shared(&workspace, &cache, 8),
            workspace.path().to_path_buf(),
            false,
        );

        let mut seen = HashSet::new();
        for i in 0..5 {
            let child = factory
                .create_child_runner(&format!("run-{i}"))
                .await
                .unwrap();
            assert!(child.workspace.starts_with(workspace.path().join("children")));
            assert!(child.workspace.is_dir());
            assert!(seen.insert(child.workspace.clone()), "duplicate workspace");
        }
    }

    #[tokio::test]
    async fn semaphore_bounds_live_children() {
        let workspace = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let factory = Arc::new(ChildRunnerFactory::new(
            shared(&workspace, &cache, 1),
            workspace.path().to_path_buf(),
            false,
        ));

        let first = factory.create_child_runner("run-0").await.unwrap();

        // A second creation can't proceed while the first child is alive.
        let blocked = {
            let factory = Arc::clone(&factory);
            tokio::time::timeout(Duration::from_millis(50), async move {
                factory.create_child_runner("run-1").await
            })
            .await
        };
        assert!(blocked.is_err(), "second child should block on the permit");

        drop(first);
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            factory.create_child_runner("run-1"),
        )
        .await
        .expect("permit released")
        .unwrap();
        assert!(second.workspace.is_dir());
    }

    #[tokio::test]
    async fn closed_factory_refuses_creation() {
        let workspace = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let factory = ChildRunnerFactory::new(
            shared(&workspace, &cache, 2),
            workspace.path().to_path_buf(),
            false,
        );
        factory.close();
        let err = factory.create_child_runner("run-0").await.unwrap_err();
        assert!(matches!(err, ChildFactoryError::Closed));
    }

    #[tokio::test]
    async fn cache_locks_are_lent_and_returned() {
        let workspace = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let shared = shared(&workspace, &cache, 2);
        let factory = ChildRunnerFactory::new(
            Arc::clone(&shared),
            workspace.path().to_path_buf(),
            false,
        );
        let cancel = CancellationToken::new();

        factory
            .acquire_cache_lock(&cancel, "run-0", "ex/lib", LockType::Read)
            .await
            .unwrap();
        assert!(shared.lock_manager.is_locked("ex/lib"));
        factory
            .release_cache_lock("run-0", "ex/lib", LockType::Read)
            .unwrap();
        assert!(!shared.lock_manager.is_locked("ex/lib"));
    }
}
