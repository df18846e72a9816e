//! Database layer: connection management, migrations, repositories

mod connection;
mod migrations;
mod repository;
mod settings_repository;

pub use connection::Database;
pub use repository::{InventoryRepository, SqliteInventoryRepository};
pub use settings_repository::{keys, SettingsRepository, SqliteSettingsRepository};
