//! Sync status surface exposed to callers

use std::fmt;

use serde::{Deserialize, Serialize};

/// The bound remote spreadsheet. At most one per local database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    /// Remote spreadsheet identifier.
    pub spreadsheet_id: String,
    /// Browsable URL of the spreadsheet.
    pub url: String,
}

/// High-level state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Success,
    Error,
    Offline,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Transient snapshot of the sync subsystem, rebuilt from persisted fields
/// plus a connectivity probe on each read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncPhase,
    /// Last successful pass (Unix ms).
    pub last_sync_at: Option<i64>,
    /// Number of queued local changes.
    pub pending_changes: i64,
    pub remote: Option<RemoteIdentity>,
}
