//! Data models for Packrat

mod category;
mod conflict;
mod item;
mod location;
mod pending_change;
mod sync_state;

pub use category::Category;
pub use conflict::{Conflict, ConflictKind, ConflictRecord};
pub use item::{Item, SyncStatus};
pub use location::Location;
pub use pending_change::{ChangeOp, ChangeStatus, EntityKind, PendingChange};
pub use sync_state::{RemoteIdentity, SyncPhase, SyncState};

use crate::error::{Error, Result};

/// Maximum length of a category or location name.
pub const MAX_NAME_LEN: usize = 50;

/// Validate a category/location name: non-empty after trimming, at most
/// [`MAX_NAME_LEN`] characters. Returns the trimmed name.
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("Name cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "Name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_trims_and_accepts() {
        assert_eq!(validate_name("  Pantry ").unwrap(), "Pantry");
    }

    #[test]
    fn validate_name_rejects_empty() {
        assert!(validate_name("   ").is_err());
    }

    #[test]
    fn validate_name_rejects_overlong() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(validate_name(&long).is_err());
        let ok = "x".repeat(MAX_NAME_LEN);
        assert!(validate_name(&ok).is_ok());
    }
}
