//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::EntityKind;

/// How the two replicas diverged for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides were modified since the last sync.
    BothModified,
    /// The entity was synced before but is gone from the remote tables.
    DeletedRemotely,
    /// The entity was deleted locally but still exists remotely.
    DeletedLocally,
}

impl ConflictKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BothModified => "both_modified",
            Self::DeletedRemotely => "deleted_remotely",
            Self::DeletedLocally => "deleted_locally",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "both_modified" => Ok(Self::BothModified),
            "deleted_remotely" => Ok(Self::DeletedRemotely),
            "deleted_locally" => Ok(Self::DeletedLocally),
            other => Err(format!("unknown conflict kind: {other}")),
        }
    }
}

/// A divergence detected during merge sync.
///
/// Conflicts are resolved by last-write-wins inside the pass and reported to
/// the caller for observability; they never block the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub entity: EntityKind,
    pub entity_id: i64,
    /// Local snapshot at conflict time.
    pub local: serde_json::Value,
    /// Remote snapshot at conflict time.
    pub remote: serde_json::Value,
    pub kind: ConflictKind,
}

/// A conflict persisted to the diagnostics log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict row identifier
    pub id: i64,
    pub conflict: Conflict,
    /// Resolution timestamp (unix ms)
    pub recorded_at: i64,
}
