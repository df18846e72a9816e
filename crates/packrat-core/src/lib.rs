//! packrat-core - Core library for Packrat
//!
//! This crate contains the shared models, the local inventory database, and
//! the sync bookkeeping (pending-change queue, conflict log, settings) used
//! by the sync engine and any user-facing shell.

pub mod db;
pub mod error;
pub mod models;
pub mod util;

pub use error::{Error, Result};
pub use models::{Category, Conflict, Item, Location, PendingChange, SyncStatus};
