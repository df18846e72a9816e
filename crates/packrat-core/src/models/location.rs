//! Location model

use serde::{Deserialize, Serialize};

/// A storage location, referenced by name from [`crate::models::Item`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Local integer id; 0 until persisted.
    pub id: i64,
    /// Unique name (case-insensitive, at most 50 chars).
    pub name: String,
    pub description: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl Location {
    /// Create a new, not-yet-persisted location.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            created_at: crate::util::unix_timestamp_ms(),
        }
    }
}
