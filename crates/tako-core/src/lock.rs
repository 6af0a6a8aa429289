//! Cross-process repository lock manager.
//!
//! Locks are JSON records under `<workspace>/locks/`, one file per
//! `(repository, type)` with a filesystem-safe canonical key. Acquisition
//! polls with exponential backoff; records carry a TTL and the owner's PID
//! so orphaned locks can be detected and reclaimed. Components acquire one
//! lock at a time and never hold one while acquiring another.
//!
//! Conflict matrix: a writer excludes all other locks, a reader excludes a
//! writer, and at most [`MAX_READERS_PER_REPO`] readers may hold a
//! repository concurrently.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tako_types::lock::{LockRecord, LockType};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Permitted concurrent readers per repository.
pub const MAX_READERS_PER_REPO: usize = 1;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from lock acquisition and release.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock busy on repository '{repository}' ({lock_type})")]
    Busy {
        repository: String,
        lock_type: LockType,
    },

    #[error("lock on '{repository}' held by run '{holder}', not '{run_id}'")]
    Ownership {
        repository: String,
        holder: String,
        run_id: String,
    },

    #[error("no {lock_type} lock held on '{repository}'")]
    NotHeld {
        repository: String,
        lock_type: LockType,
    },

    #[error("lock acquisition canceled for '{0}'")]
    Canceled(String),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock record at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// File-backed lock manager rooted at `<workspace>/locks/`.
pub struct LockManager {
    locks_dir: PathBuf,
    ttl: Duration,
    /// Lock files created by this manager, for best-effort drop cleanup.
    owned: Mutex<HashSet<PathBuf>>,
}

impl LockManager {
    /// Create the manager, ensuring the lock directory exists and sweeping
    /// stale records left by dead processes.
    pub fn new(workspace: &Path, ttl: Duration) -> Result<Self, LockError> {
        let locks_dir = workspace.join("locks");
        std::fs::create_dir_all(&locks_dir)?;
        let manager = Self {
            locks_dir,
            ttl,
            owned: Mutex::new(HashSet::new()),
        };
        let swept = manager.cleanup_stale_locks();
        if swept > 0 {
            tracing::info!(swept, "reclaimed stale lock records at startup");
        }
        Ok(manager)
    }

    /// Acquire a lock, polling until granted or the token is canceled.
    pub async fn acquire_lock(
        &self,
        cancel: &CancellationToken,
        run_id: &str,
        repository: &str,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Canceled(repository.to_string()));
            }
            match self.try_acquire(run_id, repository, lock_type) {
                Ok(()) => return Ok(()),
                Err(LockError::Busy { .. }) => {}
                Err(other) => return Err(other),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Canceled(repository.to_string())),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Acquire with an overall deadline. Elapsing the deadline surfaces as
    /// [`LockError::Busy`].
    pub async fn acquire_lock_with_timeout(
        &self,
        cancel: &CancellationToken,
        run_id: &str,
        repository: &str,
        lock_type: LockType,
        timeout: Duration,
    ) -> Result<(), LockError> {
        match tokio::time::timeout(
            timeout,
            self.acquire_lock(cancel, run_id, repository, lock_type),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(LockError::Busy {
                repository: repository.to_string(),
                lock_type,
            }),
        }
    }

    /// Single non-blocking acquisition attempt.
    fn try_acquire(
        &self,
        run_id: &str,
        repository: &str,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        // Reclaim-or-reject every live conflicting record.
        for conflicting in self.conflicting_types(lock_type) {
            let path = self.lock_path(repository, conflicting);
            match self.read_record(&path)? {
                Some(record) if self.is_stale(&record) => {
                    let _ = std::fs::remove_file(&path);
                    tracing::warn!(
                        repository,
                        holder = record.run_id.as_str(),
                        "reclaimed stale lock"
                    );
                }
                Some(_) => {
                    return Err(LockError::Busy {
                        repository: repository.to_string(),
                        lock_type,
                    });
                }
                None => {}
            }
        }

        let now = Utc::now();
        let record = LockRecord {
            run_id: run_id.to_string(),
            repository: repository.to_string(),
            lock_type,
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            process_id: std::process::id(),
        };

        let path = self.lock_path(repository, lock_type);
        let json = serde_json::to_vec_pretty(&record).expect("lock record serializes");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(&json)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LockError::Busy {
                    repository: repository.to_string(),
                    lock_type,
                });
            }
            Err(err) => return Err(LockError::Io(err)),
        }

        // A racing process may have created the opposite-type record between
        // our check and create. The later acquirer yields.
        for conflicting in self.conflicting_types(lock_type) {
            if conflicting == lock_type {
                continue;
            }
            let other_path = self.lock_path(repository, conflicting);
            if let Ok(Some(other)) = self.read_record(&other_path) {
                if !self.is_stale(&other) && other.acquired_at <= record.acquired_at {
                    let _ = std::fs::remove_file(&path);
                    return Err(LockError::Busy {
                        repository: repository.to_string(),
                        lock_type,
                    });
                }
            }
        }

        self.owned
            .lock()
            .expect("owned-lock registry poisoned")
            .insert(path);
        tracing::debug!(repository, %lock_type, run_id, "lock acquired");
        Ok(())
    }

    /// Release a held lock. The `(run_id, repository, type)` triple must
    /// match the on-disk record.
    pub fn release_lock(
        &self,
        run_id: &str,
        repository: &str,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        let path = self.lock_path(repository, lock_type);
        let record = self.read_record(&path)?.ok_or_else(|| LockError::NotHeld {
            repository: repository.to_string(),
            lock_type,
        })?;
        if record.run_id != run_id {
            return Err(LockError::Ownership {
                repository: repository.to_string(),
                holder: record.run_id,
                run_id: run_id.to_string(),
            });
        }
        std::fs::remove_file(&path)?;
        self.owned
            .lock()
            .expect("owned-lock registry poisoned")
            .remove(&path);
        tracing::debug!(repository, %lock_type, run_id, "lock released");
        Ok(())
    }

    /// Release every lock held by `run_id`. Returns the number released.
    pub fn release_all_locks(&self, run_id: &str) -> Result<usize, LockError> {
        let mut released = 0;
        for (path, record) in self.scan_records() {
            if record.run_id == run_id {
                std::fs::remove_file(&path)?;
                self.owned
                    .lock()
                    .expect("owned-lock registry poisoned")
                    .remove(&path);
                released += 1;
            }
        }
        Ok(released)
    }

    /// Whether any live lock exists on the repository.
    pub fn is_locked(&self, repository: &str) -> bool {
        [LockType::Write, LockType::Read].iter().any(|lock_type| {
            self.read_record(&self.lock_path(repository, *lock_type))
                .ok()
                .flatten()
                .map(|record| !self.is_stale(&record))
                .unwrap_or(false)
        })
    }

    /// The live record on a repository, writer first.
    pub fn get_lock_info(&self, repository: &str) -> Option<LockRecord> {
        [LockType::Write, LockType::Read]
            .iter()
            .find_map(|lock_type| {
                self.read_record(&self.lock_path(repository, *lock_type))
                    .ok()
                    .flatten()
                    .filter(|record| !self.is_stale(record))
            })
    }

    /// Every record currently on disk, live or stale, sorted by key.
    pub fn list_locks(&self) -> Vec<LockRecord> {
        self.scan_records()
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    /// Records past expiry or owned by a dead process.
    pub fn detect_deadlocks(&self) -> Vec<LockRecord> {
        self.scan_records()
            .into_iter()
            .filter(|(_, record)| self.is_stale(record))
            .map(|(_, record)| record)
            .collect()
    }

    /// Remove every stale record. Returns the number removed; I/O failures
    /// during the sweep are logged and skipped.
    pub fn cleanup_stale_locks(&self) -> usize {
        let mut removed = 0;
        for (path, record) in self.scan_records() {
            if self.is_stale(&record) {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "failed to remove stale lock")
                    }
                }
            }
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Lock types whose live records block acquisition of `requested`.
    /// With the single-reader constraint every live record conflicts.
    fn conflicting_types(&self, requested: LockType) -> Vec<LockType> {
        match requested {
            LockType::Write => vec![LockType::Write, LockType::Read],
            LockType::Read if MAX_READERS_PER_REPO <= 1 => {
                vec![LockType::Write, LockType::Read]
            }
            LockType::Read => vec![LockType::Write],
        }
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        record.is_expired(Utc::now()) || !process_alive(record.process_id)
    }

    fn lock_path(&self, repository: &str, lock_type: LockType) -> PathBuf {
        self.locks_dir
            .join(format!("{}.lock", lock_key(repository, lock_type)))
    }

    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>, LockError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(LockError::Io(err)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| LockError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn scan_records(&self) -> Vec<(PathBuf, LockRecord)> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&self.locks_dir) {
            Ok(entries) => entries,
            Err(_) => return records,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Ok(Some(record)) = self.read_record(&path) {
                records.push((path, record));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }
}

impl Drop for LockManager {
    /// Best-effort removal of lock files this manager created.
    fn drop(&mut self) {
        if let Ok(owned) = self.owned.lock() {
            for path in owned.iter() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Canonical filesystem-safe key for a `(repository, type)` pair.
fn lock_key(repository: &str, lock_type: LockType) -> String {
    let safe: String = repository
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{safe}-{lock_type}")
}

/// PID liveness via the process table.
fn process_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), false);
    system.process(target).is_some()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
