//! Key-value settings repository
//!
//! Small bits of engine state live here: the bound spreadsheet, the last
//! successful sync time, and the opaque credential blob the sync crate
//! serializes for itself.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::RemoteIdentity;
use crate::util::is_http_url;

/// Well-known settings keys.
pub mod keys {
    pub const REMOTE_IDENTITY: &str = "sync.remote_identity";
    pub const LAST_SYNC_AT: &str = "sync.last_sync_at";
    pub const SYNC_ENABLED: &str = "sync.enabled";
    pub const CLIENT_ID: &str = "sync.client_id";
    pub const CREDENTIALS: &str = "auth.credentials";
    pub const AUTH_FLOW: &str = "auth.flow_state";
}

/// Trait for settings storage operations
pub trait SettingsRepository {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// The bound remote spreadsheet, if any.
    fn remote_identity(&self) -> Result<Option<RemoteIdentity>> {
        self.get(keys::REMOTE_IDENTITY)?
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    fn set_remote_identity(&self, remote: &RemoteIdentity) -> Result<()> {
        if !is_http_url(&remote.url) {
            return Err(Error::InvalidInput(format!(
                "Remote URL must start with http:// or https://: {}",
                remote.url
            )));
        }
        self.set(keys::REMOTE_IDENTITY, &serde_json::to_string(remote)?)
    }

    fn clear_remote_identity(&self) -> Result<()> {
        self.delete(keys::REMOTE_IDENTITY)
    }

    /// Last successful sync pass (Unix ms).
    fn last_sync_at(&self) -> Result<Option<i64>> {
        Ok(self
            .get(keys::LAST_SYNC_AT)?
            .and_then(|raw| raw.parse().ok()))
    }

    fn set_last_sync_at(&self, timestamp_ms: i64) -> Result<()> {
        self.set(keys::LAST_SYNC_AT, &timestamp_ms.to_string())
    }

    /// Whether background sync is enabled. Defaults to true.
    fn sync_enabled(&self) -> Result<bool> {
        Ok(self
            .get(keys::SYNC_ENABLED)?
            .is_none_or(|raw| raw != "false"))
    }

    fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.set(keys::SYNC_ENABLED, if enabled { "true" } else { "false" })
    }

    /// Stable per-installation identifier, minted on first read.
    fn client_id(&self) -> Result<String> {
        if let Some(id) = self.get(keys::CLIENT_ID)? {
            return Ok(id);
        }
        let id = uuid::Uuid::now_v7().to_string();
        self.set(keys::CLIENT_ID, &id)?;
        Ok(id)
    }
}

/// `SQLite` implementation of `SettingsRepository`
pub struct SqliteSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for SqliteSettingsRepository<'_> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn set_get_delete_round_trip() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        assert_eq!(repo.get("missing").unwrap(), None);
        repo.set("theme", "dark").unwrap();
        repo.set("theme", "light").unwrap();
        assert_eq!(repo.get("theme").unwrap().as_deref(), Some("light"));
        repo.delete("theme").unwrap();
        assert_eq!(repo.get("theme").unwrap(), None);
    }

    #[test]
    fn remote_identity_round_trips() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        assert_eq!(repo.remote_identity().unwrap(), None);

        let remote = RemoteIdentity {
            spreadsheet_id: "sheet-123".to_string(),
            url: "https://example.com/sheet-123".to_string(),
        };
        repo.set_remote_identity(&remote).unwrap();
        assert_eq!(repo.remote_identity().unwrap(), Some(remote));

        repo.clear_remote_identity().unwrap();
        assert_eq!(repo.remote_identity().unwrap(), None);
    }

    #[test]
    fn remote_identity_rejects_non_http_url() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        let remote = RemoteIdentity {
            spreadsheet_id: "sheet-123".to_string(),
            url: "docs.example.com/sheet-123".to_string(),
        };
        assert!(repo.set_remote_identity(&remote).is_err());
    }

    #[test]
    fn last_sync_at_parses_back() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        assert_eq!(repo.last_sync_at().unwrap(), None);
        repo.set_last_sync_at(1_700_000_000_000).unwrap();
        assert_eq!(repo.last_sync_at().unwrap(), Some(1_700_000_000_000));
    }

    #[test]
    fn sync_enabled_defaults_to_true() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        assert!(repo.sync_enabled().unwrap());
        repo.set_sync_enabled(false).unwrap();
        assert!(!repo.sync_enabled().unwrap());
    }

    #[test]
    fn client_id_is_minted_once() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        let first = repo.client_id().unwrap();
        let second = repo.client_id().unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
