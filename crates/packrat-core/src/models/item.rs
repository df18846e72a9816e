//! Inventory item model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Remote-reflection state of a locally stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local row matches the remote table.
    Synced,
    /// A local mutation has not yet been reflected remotely.
    Pending,
    /// The last attempt to reflect this row remotely failed.
    Error,
}

impl SyncStatus {
    /// Stable string form used in the database and remote rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synced" => Ok(Self::Synced),
            "pending" | "" => Ok(Self::Pending),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// An inventory item.
///
/// Categories and locations are referenced by name, not id, so a rename
/// cascades through every referencing item (see the repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Local integer id (sqlite rowid); 0 until persisted.
    pub id: i64,
    pub name: String,
    pub barcode: Option<String>,
    pub quantity: i64,
    pub min_quantity: Option<i64>,
    /// Category name (case-insensitive reference).
    pub category: String,
    /// Location name (case-insensitive reference).
    pub location: String,
    pub notes: String,
    /// Ordered photo blob references.
    pub photos: Vec<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    pub sync_status: SyncStatus,
    pub synced_at: Option<i64>,
}

impl Item {
    /// Create a new, not-yet-persisted item.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        let now = crate::util::unix_timestamp_ms();
        Self {
            id: 0,
            name: name.into(),
            barcode: None,
            quantity: 0,
            min_quantity: None,
            category: category.into(),
            location: location.into(),
            notes: String::new(),
            photos: Vec::new(),
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
            synced_at: None,
        }
    }

    /// Stamp a local mutation: bump `updated_at` and flip back to pending.
    pub fn touch(&mut self, now_ms: i64) {
        self.updated_at = now_ms;
        self.sync_status = SyncStatus::Pending;
    }

    /// Whether the quantity has fallen below the configured minimum.
    #[must_use]
    pub fn is_low_stock(&self) -> bool {
        self.min_quantity.is_some_and(|min| self.quantity < min)
    }
}
