//! Inventory repository implementation
//!
//! Every local mutation writes the entity and enqueues a pending change in
//! the same transaction, so the queue can never disagree with the data.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::util::{compact_text, normalize_text_option, unix_timestamp_ms};
use crate::models::{
    validate_name, Category, ChangeOp, ChangeStatus, Conflict, ConflictKind, ConflictRecord,
    EntityKind, Item, Location, PendingChange, SyncStatus,
};

/// Trait for inventory storage operations
pub trait InventoryRepository {
    // Items
    fn create_item(&self, item: &Item) -> Result<Item>;
    fn get_item(&self, id: i64) -> Result<Option<Item>>;
    fn list_items(&self) -> Result<Vec<Item>>;
    fn update_item(&self, item: &Item) -> Result<Item>;
    fn delete_item(&self, id: i64) -> Result<()>;
    /// Overwrite a local row with a remote snapshot without enqueuing a
    /// change (merge apply path). Inserts when the row does not exist.
    fn apply_remote_item(&self, item: &Item) -> Result<()>;
    /// Flip every pending item to synced and stamp `synced_at`.
    fn mark_items_synced(&self, now_ms: i64) -> Result<()>;

    // Categories
    fn create_category(&self, name: &str, color: Option<&str>) -> Result<Category>;
    fn list_categories(&self) -> Result<Vec<Category>>;
    /// Rename a category and cascade the new name to every referencing
    /// item, atomically.
    fn rename_category(&self, id: i64, new_name: &str) -> Result<Category>;
    fn delete_category(&self, id: i64) -> Result<()>;
    /// Insert a remote category unless a case-insensitive name match
    /// already exists (merge union; local wins ties).
    fn insert_category_if_absent(&self, category: &Category) -> Result<()>;

    // Locations
    fn create_location(&self, name: &str, description: Option<&str>) -> Result<Location>;
    fn list_locations(&self) -> Result<Vec<Location>>;
    fn rename_location(&self, id: i64, new_name: &str) -> Result<Location>;
    fn delete_location(&self, id: i64) -> Result<()>;
    fn insert_location_if_absent(&self, location: &Location) -> Result<()>;

    /// Wholesale local replace for cloud-to-device initial sync: clears
    /// categories, locations and items, then repopulates them as synced.
    fn replace_all(
        &self,
        categories: &[Category],
        locations: &[Location],
        items: &[Item],
    ) -> Result<()>;

    // Pending-change queue
    fn pending_changes(&self) -> Result<Vec<PendingChange>>;
    fn pending_count(&self) -> Result<i64>;
    fn mark_change_processing(&self, id: i64, now_ms: i64) -> Result<()>;
    fn mark_change_completed(&self, id: i64) -> Result<()>;
    fn mark_change_failed(&self, id: i64, error: &str) -> Result<()>;
    /// Drop completed rows after a successful pass. Failed rows stay
    /// queryable for diagnostics.
    fn clear_completed_changes(&self) -> Result<()>;
    /// Drop the whole queue (initial sync established a fresh baseline).
    fn clear_pending_changes(&self) -> Result<()>;

    // Conflict diagnostics log
    fn record_conflict(&self, conflict: &Conflict, now_ms: i64) -> Result<()>;
    fn list_conflicts(&self, limit: usize) -> Result<Vec<ConflictRecord>>;
}

/// `SQLite` implementation of `InventoryRepository`
pub struct SqliteInventoryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteInventoryRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an item from a database row
    fn parse_item(row: &Row<'_>) -> rusqlite::Result<Item> {
        let photos_json: String = row.get(8)?;
        let photos = serde_json::from_str(&photos_json).unwrap_or_default();
        let status: String = row.get(11)?;
        Ok(Item {
            id: row.get(0)?,
            name: row.get(1)?,
            barcode: row.get(2)?,
            quantity: row.get(3)?,
            min_quantity: row.get(4)?,
            category: row.get(5)?,
            location: row.get(6)?,
            notes: row.get(7)?,
            photos,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            sync_status: status.parse().unwrap_or(SyncStatus::Pending),
            synced_at: row.get(12)?,
        })
    }

    fn parse_category(row: &Row<'_>) -> rusqlite::Result<Category> {
        Ok(Category {
            id: row.get(0)?,
            name: row.get(1)?,
            color: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn parse_location(row: &Row<'_>) -> rusqlite::Result<Location> {
        Ok(Location {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn parse_change(row: &Row<'_>) -> rusqlite::Result<PendingChange> {
        let entity: String = row.get(1)?;
        let op: String = row.get(3)?;
        let payload: String = row.get(4)?;
        let status: String = row.get(5)?;
        Ok(PendingChange {
            id: row.get(0)?,
            entity: entity.parse().unwrap_or(EntityKind::Item),
            entity_id: row.get(2)?,
            op: op.parse().unwrap_or(ChangeOp::Update),
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            status: status.parse().unwrap_or(ChangeStatus::Pending),
            error: row.get(6)?,
            created_at: row.get(7)?,
            attempted_at: row.get(8)?,
        })
    }

    /// Enqueue a pending change on the current connection. Callers are
    /// responsible for wrapping this in the same transaction as the
    /// entity write.
    fn enqueue(
        &self,
        entity: EntityKind,
        entity_id: i64,
        op: ChangeOp,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_changes (entity, entity_id, op, payload, status, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?)",
            params![
                entity.as_str(),
                entity_id,
                op.as_str(),
                serde_json::to_string(payload)?,
                unix_timestamp_ms(),
            ],
        )?;
        Ok(())
    }

    fn insert_item_row(&self, item: &Item) -> Result<()> {
        self.conn.execute(
            "INSERT INTO items (id, name, barcode, quantity, min_quantity, category, location,
                                notes, photos, created_at, updated_at, sync_status, synced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id,
                item.name,
                item.barcode,
                item.quantity,
                item.min_quantity,
                item.category,
                item.location,
                item.notes,
                serde_json::to_string(&item.photos)?,
                item.created_at,
                item.updated_at,
                item.sync_status.as_str(),
                item.synced_at,
            ],
        )?;
        Ok(())
    }
}

const ITEM_COLUMNS: &str = "id, name, barcode, quantity, min_quantity, category, location, \
                            notes, photos, created_at, updated_at, sync_status, synced_at";

impl InventoryRepository for SqliteInventoryRepository<'_> {
    fn create_item(&self, item: &Item) -> Result<Item> {
        let tx = self.conn.unchecked_transaction()?;

        self.conn.execute(
            "INSERT INTO items (name, barcode, quantity, min_quantity, category, location,
                                notes, photos, created_at, updated_at, sync_status, synced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL)",
            params![
                item.name,
                item.barcode,
                item.quantity,
                item.min_quantity,
                item.category,
                item.location,
                item.notes,
                serde_json::to_string(&item.photos)?,
                item.created_at,
                item.updated_at,
            ],
        )?;

        let mut created = item.clone();
        created.id = self.conn.last_insert_rowid();
        created.sync_status = SyncStatus::Pending;
        created.synced_at = None;

        self.enqueue(
            EntityKind::Item,
            created.id,
            ChangeOp::Create,
            &serde_json::to_value(&created)?,
        )?;

        tx.commit()?;
        Ok(created)
    }

    fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"),
                params![id],
                Self::parse_item,
            )
            .optional()?;
        Ok(item)
    }

    fn list_items(&self) -> Result<Vec<Item>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY updated_at DESC"))?;
        let items = stmt
            .query_map([], Self::parse_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn update_item(&self, item: &Item) -> Result<Item> {
        let now = unix_timestamp_ms();
        let tx = self.conn.unchecked_transaction()?;

        let rows = self.conn.execute(
            "UPDATE items SET name = ?, barcode = ?, quantity = ?, min_quantity = ?,
                              category = ?, location = ?, notes = ?, photos = ?,
                              updated_at = ?, sync_status = 'pending'
             WHERE id = ?",
            params![
                item.name,
                item.barcode,
                item.quantity,
                item.min_quantity,
                item.category,
                item.location,
                item.notes,
                serde_json::to_string(&item.photos)?,
                now,
                item.id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("item {}", item.id)));
        }

        let mut updated = item.clone();
        updated.updated_at = now;
        updated.sync_status = SyncStatus::Pending;

        self.enqueue(
            EntityKind::Item,
            updated.id,
            ChangeOp::Update,
            &serde_json::to_value(&updated)?,
        )?;

        tx.commit()?;
        Ok(updated)
    }

    fn delete_item(&self, id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let Some(existing) = self.get_item(id)? else {
            return Err(Error::NotFound(format!("item {id}")));
        };

        self.conn
            .execute("DELETE FROM items WHERE id = ?", params![id])?;

        self.enqueue(
            EntityKind::Item,
            id,
            ChangeOp::Delete,
            &serde_json::to_value(&existing)?,
        )?;

        tx.commit()?;
        Ok(())
    }

    fn apply_remote_item(&self, item: &Item) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO items
                 (id, name, barcode, quantity, min_quantity, category, location,
                  notes, photos, created_at, updated_at, sync_status, synced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'synced', ?)",
            params![
                item.id,
                item.name,
                item.barcode,
                item.quantity,
                item.min_quantity,
                item.category,
                item.location,
                item.notes,
                serde_json::to_string(&item.photos)?,
                item.created_at,
                item.updated_at,
                item.synced_at.or_else(|| Some(unix_timestamp_ms())),
            ],
        )?;
        Ok(())
    }

    fn mark_items_synced(&self, now_ms: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET sync_status = 'synced', synced_at = ?
             WHERE sync_status != 'synced'",
            params![now_ms],
        )?;
        Ok(())
    }

    fn create_category(&self, name: &str, color: Option<&str>) -> Result<Category> {
        let name = validate_name(name)?;
        let color = normalize_text_option(color.map(ToOwned::to_owned));
        let now = unix_timestamp_ms();
        let tx = self.conn.unchecked_transaction()?;

        self.conn.execute(
            "INSERT INTO categories (name, color, created_at) VALUES (?, ?, ?)",
            params![name, color, now],
        )?;

        let category = Category {
            id: self.conn.last_insert_rowid(),
            name,
            color,
            created_at: now,
        };

        self.enqueue(
            EntityKind::Category,
            category.id,
            ChangeOp::Create,
            &serde_json::to_value(&category)?,
        )?;

        tx.commit()?;
        Ok(category)
    }

    fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, color, created_at FROM categories ORDER BY name COLLATE NOCASE",
        )?;
        let categories = stmt
            .query_map([], Self::parse_category)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }

    fn rename_category(&self, id: i64, new_name: &str) -> Result<Category> {
        let new_name = validate_name(new_name)?;
        let tx = self.conn.unchecked_transaction()?;

        let old: Category = self
            .conn
            .query_row(
                "SELECT id, name, color, created_at FROM categories WHERE id = ?",
                params![id],
                Self::parse_category,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("category {id}")))?;

        self.conn.execute(
            "UPDATE categories SET name = ? WHERE id = ?",
            params![new_name, id],
        )?;

        // Cascade to referencing items; they become pending like any other
        // local edit.
        let now = unix_timestamp_ms();
        self.conn.execute(
            "UPDATE items SET category = ?, updated_at = ?, sync_status = 'pending'
             WHERE category = ? COLLATE NOCASE",
            params![new_name, now, old.name],
        )?;

        let renamed = Category {
            name: new_name,
            ..old
        };

        self.enqueue(
            EntityKind::Category,
            id,
            ChangeOp::Update,
            &serde_json::to_value(&renamed)?,
        )?;

        tx.commit()?;
        Ok(renamed)
    }

    fn delete_category(&self, id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let old: Category = self
            .conn
            .query_row(
                "SELECT id, name, color, created_at FROM categories WHERE id = ?",
                params![id],
                Self::parse_category,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("category {id}")))?;

        self.conn
            .execute("DELETE FROM categories WHERE id = ?", params![id])?;

        self.enqueue(
            EntityKind::Category,
            id,
            ChangeOp::Delete,
            &serde_json::to_value(&old)?,
        )?;

        tx.commit()?;
        Ok(())
    }

    fn insert_category_if_absent(&self, category: &Category) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO categories (name, color, created_at) VALUES (?, ?, ?)",
            params![category.name, category.color, category.created_at],
        )?;
        Ok(())
    }

    fn create_location(&self, name: &str, description: Option<&str>) -> Result<Location> {
        let name = validate_name(name)?;
        let description = normalize_text_option(description.map(ToOwned::to_owned));
        let now = unix_timestamp_ms();
        let tx = self.conn.unchecked_transaction()?;

        self.conn.execute(
            "INSERT INTO locations (name, description, created_at) VALUES (?, ?, ?)",
            params![name, description, now],
        )?;

        let location = Location {
            id: self.conn.last_insert_rowid(),
            name,
            description,
            created_at: now,
        };

        self.enqueue(
            EntityKind::Location,
            location.id,
            ChangeOp::Create,
            &serde_json::to_value(&location)?,
        )?;

        tx.commit()?;
        Ok(location)
    }

    fn list_locations(&self) -> Result<Vec<Location>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, created_at FROM locations ORDER BY name COLLATE NOCASE",
        )?;
        let locations = stmt
            .query_map([], Self::parse_location)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(locations)
    }

    fn rename_location(&self, id: i64, new_name: &str) -> Result<Location> {
        let new_name = validate_name(new_name)?;
        let tx = self.conn.unchecked_transaction()?;

        let old: Location = self
            .conn
            .query_row(
                "SELECT id, name, description, created_at FROM locations WHERE id = ?",
                params![id],
                Self::parse_location,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("location {id}")))?;

        self.conn.execute(
            "UPDATE locations SET name = ? WHERE id = ?",
            params![new_name, id],
        )?;

        let now = unix_timestamp_ms();
        self.conn.execute(
            "UPDATE items SET location = ?, updated_at = ?, sync_status = 'pending'
             WHERE location = ? COLLATE NOCASE",
            params![new_name, now, old.name],
        )?;

        let renamed = Location {
            name: new_name,
            ..old
        };

        self.enqueue(
            EntityKind::Location,
            id,
            ChangeOp::Update,
            &serde_json::to_value(&renamed)?,
        )?;

        tx.commit()?;
        Ok(renamed)
    }

    fn delete_location(&self, id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let old: Location = self
            .conn
            .query_row(
                "SELECT id, name, description, created_at FROM locations WHERE id = ?",
                params![id],
                Self::parse_location,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("location {id}")))?;

        self.conn
            .execute("DELETE FROM locations WHERE id = ?", params![id])?;

        self.enqueue(
            EntityKind::Location,
            id,
            ChangeOp::Delete,
            &serde_json::to_value(&old)?,
        )?;

        tx.commit()?;
        Ok(())
    }

    fn insert_location_if_absent(&self, location: &Location) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO locations (name, description, created_at) VALUES (?, ?, ?)",
            params![location.name, location.description, location.created_at],
        )?;
        Ok(())
    }

    fn replace_all(
        &self,
        categories: &[Category],
        locations: &[Location],
        items: &[Item],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        self.conn.execute("DELETE FROM items", [])?;
        self.conn.execute("DELETE FROM categories", [])?;
        self.conn.execute("DELETE FROM locations", [])?;

        for category in categories {
            self.conn.execute(
                "INSERT INTO categories (id, name, color, created_at) VALUES (?, ?, ?, ?)",
                params![category.id, category.name, category.color, category.created_at],
            )?;
        }
        for location in locations {
            self.conn.execute(
                "INSERT INTO locations (id, name, description, created_at) VALUES (?, ?, ?, ?)",
                params![
                    location.id,
                    location.name,
                    location.description,
                    location.created_at
                ],
            )?;
        }
        let now = unix_timestamp_ms();
        for item in items {
            let mut row = item.clone();
            row.sync_status = SyncStatus::Synced;
            row.synced_at = Some(now);
            self.insert_item_row(&row)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn pending_changes(&self) -> Result<Vec<PendingChange>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity, entity_id, op, payload, status, error, created_at, attempted_at
             FROM pending_changes
             WHERE status IN ('pending', 'processing', 'failed')
             ORDER BY id",
        )?;
        let changes = stmt
            .query_map([], Self::parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn pending_count(&self) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_changes WHERE status IN ('pending', 'processing', 'failed')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn mark_change_processing(&self, id: i64, now_ms: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_changes SET status = 'processing', attempted_at = ? WHERE id = ?",
            params![now_ms, id],
        )?;
        Ok(())
    }

    fn mark_change_completed(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_changes SET status = 'completed', error = NULL WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    fn mark_change_failed(&self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_changes SET status = 'failed', error = ? WHERE id = ?",
            params![compact_text(error), id],
        )?;
        Ok(())
    }

    fn clear_completed_changes(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_changes WHERE status = 'completed'", [])?;
        Ok(())
    }

    fn clear_pending_changes(&self) -> Result<()> {
        self.conn.execute("DELETE FROM pending_changes", [])?;
        Ok(())
    }

    fn record_conflict(&self, conflict: &Conflict, now_ms: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (entity, entity_id, local_data, remote_data, kind, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                conflict.entity.as_str(),
                conflict.entity_id,
                serde_json::to_string(&conflict.local)?,
                serde_json::to_string(&conflict.remote)?,
                conflict.kind.as_str(),
                now_ms,
            ],
        )?;
        Ok(())
    }

    fn list_conflicts(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity, entity_id, local_data, remote_data, kind, recorded_at
             FROM sync_conflicts ORDER BY recorded_at DESC LIMIT ?",
        )?;

        #[allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
        let records = stmt
            .query_map(params![limit as i64], |row| {
                let entity: String = row.get(1)?;
                let local: String = row.get(3)?;
                let remote: String = row.get(4)?;
                let kind: String = row.get(5)?;
                Ok(ConflictRecord {
                    id: row.get(0)?,
                    conflict: Conflict {
                        entity: entity.parse().unwrap_or(EntityKind::Item),
                        entity_id: row.get(2)?,
                        local: serde_json::from_str(&local).unwrap_or(serde_json::Value::Null),
                        remote: serde_json::from_str(&remote).unwrap_or(serde_json::Value::Null),
                        kind: kind.parse().unwrap_or(ConflictKind::BothModified),
                    },
                    recorded_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
