//! Pending-change queue model
//!
//! Every local create/update/delete enqueues a `PendingChange` in the same
//! transaction as the mutation itself. The sync engine is the only consumer:
//! it moves rows pending -> processing -> completed/failed and clears the
//! queue after a successful pass. Failed rows are never silently dropped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which kind of entity a change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Item,
    Category,
    Location,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Category => "category",
            Self::Location => "location",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "item" => Ok(Self::Item),
            "category" => Ok(Self::Category),
            "location" => Ok(Self::Location),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// The local operation a change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ChangeOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown change op: {other}")),
        }
    }
}

/// Lifecycle state of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChangeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown change status: {other}")),
        }
    }
}

/// A durable record of a local mutation not yet reflected remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Queue row id; 0 until persisted.
    pub id: i64,
    pub entity: EntityKind,
    pub entity_id: i64,
    pub op: ChangeOp,
    /// Snapshot of the entity at mutation time.
    pub payload: serde_json::Value,
    pub status: ChangeStatus,
    pub error: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Timestamp of the last sync attempt (Unix ms)
    pub attempted_at: Option<i64>,
}

impl PendingChange {
    /// Create a new pending change for an entity snapshot.
    #[must_use]
    pub fn new(entity: EntityKind, entity_id: i64, op: ChangeOp, payload: serde_json::Value) -> Self {
        Self {
            id: 0,
            entity,
            entity_id,
            op,
            payload,
            status: ChangeStatus::Pending,
            error: None,
            created_at: crate::util::unix_timestamp_ms(),
            attempted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_round_trips() {
        for kind in [EntityKind::Item, EntityKind::Category, EntityKind::Location] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn change_op_round_trips() {
        for op in [ChangeOp::Create, ChangeOp::Update, ChangeOp::Delete] {
            assert_eq!(op.as_str().parse::<ChangeOp>().unwrap(), op);
        }
    }

    #[test]
    fn new_change_starts_pending() {
        let change = PendingChange::new(
            EntityKind::Item,
            7,
            ChangeOp::Update,
            serde_json::json!({"name": "Batteries"}),
        );
        assert_eq!(change.status, ChangeStatus::Pending);
        assert!(change.error.is_none());
        assert!(change.attempted_at.is_none());
    }
}
