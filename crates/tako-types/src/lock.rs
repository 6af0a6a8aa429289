//! On-disk lock records for cross-process repository locking.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read/write lock discipline for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// JSON record persisted for every held lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Run that holds the lock.
    pub run_id: String,
    /// Locked repository (`owner/repo`).
    pub repository: String,
    #[serde(rename = "type")]
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    /// TTL boundary; records past expiry are reclaimable.
    pub expires_at: DateTime<Utc>,
    /// PID of the owning process, for liveness checks.
    pub process_id: u32,
}

impl LockRecord {
    /// Whether the record's TTL has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
