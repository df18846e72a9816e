//! Category model

use serde::{Deserialize, Serialize};

/// An item category, referenced by name from [`crate::models::Item`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Local integer id; 0 until persisted.
    pub id: i64,
    /// Unique name (case-insensitive, at most 50 chars).
    pub name: String,
    /// Optional display color (e.g. `#ff8800`).
    pub color: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl Category {
    /// Create a new, not-yet-persisted category.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            color: None,
            created_at: crate::util::unix_timestamp_ms(),
        }
    }
}
