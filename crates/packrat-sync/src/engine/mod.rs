//! The sync engine.
//!
//! Drives full and incremental passes over the trait seams for the table
//! store, blob store, and connectivity probe, so the pass logic is testable
//! against in-memory fakes.

pub mod merge;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use packrat_core::db::{
    Database, InventoryRepository, SettingsRepository, SqliteInventoryRepository,
    SqliteSettingsRepository,
};
use packrat_core::models::{
    Category, ChangeOp, Conflict, EntityKind, Item, Location, PendingChange, RemoteIdentity,
    SyncPhase, SyncState,
};

use crate::auth::TokenSource;
use crate::error::{AuthError, BlobResult, SyncError, SyncResult, TableResult};
use crate::sheets::{
    self, metadata_keys, Table,
};

pub use merge::{plan_merge, MergeInput, MergePlan, CLOCK_SKEW_MS};

/// Remote tabular storage as the engine sees it.
#[async_trait::async_trait]
pub trait TableStore: Send + Sync {
    async fn get_or_create_remote(&self, display_name: &str) -> TableResult<RemoteIdentity>;
    async fn read_table(&self, spreadsheet_id: &str, table: Table) -> TableResult<Vec<Vec<String>>>;
    async fn overwrite_table(
        &self,
        spreadsheet_id: &str,
        table: Table,
        rows: Vec<Vec<String>>,
    ) -> TableResult<()>;
    async fn read_metadata(&self, spreadsheet_id: &str, key: &str) -> TableResult<Option<String>>;
    async fn write_metadata(&self, spreadsheet_id: &str, key: &str, value: &str)
        -> TableResult<()>;
}

/// Remote photo storage as the engine sees it. Both operations are
/// best-effort per photo and return how many blobs actually moved.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn replace_item_photos(&self, item: &Item) -> BlobResult<u32>;
    async fn download_item_photos(&self, item: &Item) -> BlobResult<u32>;
}

/// Answers "can we reach the remote right now".
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe that issues a cheap HEAD request.
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    pub fn new(url: impl Into<String>) -> SyncResult<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .map_err(|error| SyncError::Table(error.into()))?,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_online(&self) -> bool {
        self.client.head(&self.url).send().await.is_ok()
    }
}

/// Progress and outcome notifications for a pass. All methods default to
/// no-ops so callers implement only what they surface.
pub trait SyncCallbacks: Send + Sync {
    fn on_status(&self, _status: SyncPhase) {}
    fn on_progress(&self, _phase: &str, _current: usize, _total: usize) {}
    fn on_conflict(&self, _conflicts: &[Conflict]) {}
    fn on_complete(&self, _report: &SyncReport) {}
    fn on_error(&self, _message: &str) {}
}

/// Callbacks implementation that surfaces nothing.
pub struct NoCallbacks;

impl SyncCallbacks for NoCallbacks {}

/// Direction of a full (initial) sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Local state overwrites the remote tables.
    DeviceToCloud,
    /// Remote tables replace local state wholesale.
    CloudToDevice,
    /// Two-way merge over the full data sets.
    Merge,
}

/// Outcome summary of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub items_synced: usize,
    pub categories_synced: usize,
    pub locations_synced: usize,
    pub conflicts: Vec<Conflict>,
    /// Non-fatal problems (photo batch failures and the like).
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Snapshot of local state read under one lock.
struct LocalSnapshot {
    items: Vec<Item>,
    categories: Vec<Category>,
    locations: Vec<Location>,
    last_sync_at: Option<i64>,
    remote: Option<RemoteIdentity>,
    client_id: String,
}

pub struct SyncEngine {
    db: Arc<StdMutex<Database>>,
    tables: Arc<dyn TableStore>,
    blobs: Arc<dyn BlobStore>,
    probe: Arc<dyn ConnectivityProbe>,
    auth: Arc<dyn TokenSource>,
    /// Display name used when a spreadsheet must be created.
    remote_name: String,
    /// One pass at a time; a second caller gets `AlreadyRunning`.
    pass_guard: tokio::sync::Mutex<()>,
    phase: StdMutex<SyncPhase>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<StdMutex<Database>>,
        tables: Arc<dyn TableStore>,
        blobs: Arc<dyn BlobStore>,
        probe: Arc<dyn ConnectivityProbe>,
        auth: Arc<dyn TokenSource>,
        remote_name: impl Into<String>,
    ) -> Self {
        Self {
            db,
            tables,
            blobs,
            probe,
            auth,
            remote_name: remote_name.into(),
            pass_guard: tokio::sync::Mutex::new(()),
            phase: StdMutex::new(SyncPhase::Idle),
        }
    }

    /// Current state of the sync subsystem, rebuilt on each call.
    pub fn status(&self) -> SyncResult<SyncState> {
        let status = *self.phase.lock().map_err(poisoned)?;
        let db = self.db.lock().map_err(poisoned)?;
        let repo = SqliteInventoryRepository::new(db.connection());
        let settings = SqliteSettingsRepository::new(db.connection());
        Ok(SyncState {
            status,
            last_sync_at: settings.last_sync_at()?,
            pending_changes: repo.pending_count()?,
            remote: settings.remote_identity()?,
        })
    }

    /// Full sync in the chosen direction. Binds a remote spreadsheet when
    /// none is bound yet.
    pub async fn initial_sync(
        &self,
        direction: SyncDirection,
        callbacks: &dyn SyncCallbacks,
    ) -> SyncResult<SyncReport> {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };

        let started = Instant::now();
        let mut report = SyncReport::default();

        if !self.preflight(callbacks).await? {
            return Ok(report);
        }
        self.set_phase(SyncPhase::Syncing, callbacks)?;

        let result = self
            .initial_sync_inner(direction, callbacks, &mut report)
            .await;
        self.finish(result, report, started, callbacks)
    }

    /// Push queued local changes, or pull when the remote has moved on.
    pub async fn incremental_sync(&self, callbacks: &dyn SyncCallbacks) -> SyncResult<SyncReport> {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };

        let started = Instant::now();
        let mut report = SyncReport::default();

        if !self.preflight(callbacks).await? {
            return Ok(report);
        }
        self.set_phase(SyncPhase::Syncing, callbacks)?;

        let result = self.incremental_sync_inner(callbacks, &mut report).await;
        self.finish(result, report, started, callbacks)
    }

    /// Shared guards: connectivity first (offline is a state, not an
    /// error), then credentials. Returns false when the pass should be
    /// skipped quietly.
    async fn preflight(&self, callbacks: &dyn SyncCallbacks) -> SyncResult<bool> {
        if !self.probe.is_online().await {
            tracing::debug!("Skipping sync pass: offline");
            self.set_phase(SyncPhase::Offline, callbacks)?;
            return Ok(false);
        }

        if let Err(error) = self.auth.token().await {
            let error = match error {
                AuthError::TokenExpired => SyncError::NotSignedIn,
                other => SyncError::Auth(other),
            };
            self.set_phase(SyncPhase::Error, callbacks)?;
            callbacks.on_error(&error.to_string());
            return Err(error);
        }
        Ok(true)
    }

    fn finish(
        &self,
        result: SyncResult<()>,
        mut report: SyncReport,
        started: Instant,
        callbacks: &dyn SyncCallbacks,
    ) -> SyncResult<SyncReport> {
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(()) => {
                self.set_phase(SyncPhase::Success, callbacks)?;
                tracing::info!(
                    "Sync pass finished: {} items, {} conflicts, {} errors in {}ms",
                    report.items_synced,
                    report.conflicts.len(),
                    report.errors.len(),
                    report.duration_ms
                );
                callbacks.on_complete(&report);
                Ok(report)
            }
            Err(error) => {
                *self.phase.lock().map_err(poisoned)? = SyncPhase::Error;
                let message = error.to_string();
                tracing::warn!("Sync pass failed: {message}");
                callbacks.on_status(SyncPhase::Error);
                callbacks.on_error(&message);
                Err(error)
            }
        }
    }

    fn set_phase(&self, phase: SyncPhase, callbacks: &dyn SyncCallbacks) -> SyncResult<()> {
        *self.phase.lock().map_err(poisoned)? = phase;
        callbacks.on_status(phase);
        Ok(())
    }

    async fn initial_sync_inner(
        &self,
        direction: SyncDirection,
        callbacks: &dyn SyncCallbacks,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let remote = self.bind_remote().await?;
        let queued = self.queued_changes()?;
        self.begin_processing(&queued)?;

        let outcome = match direction {
            SyncDirection::DeviceToCloud => {
                self.push_everything(&remote, callbacks, report).await
            }
            SyncDirection::CloudToDevice => {
                self.pull_everything(&remote, callbacks, report).await
            }
            SyncDirection::Merge => self.merge_pass(&remote, callbacks, report).await,
        };
        self.settle_queue(&queued, &outcome)?;
        outcome?;

        self.stamp_success(&remote).await
    }

    async fn incremental_sync_inner(
        &self,
        callbacks: &dyn SyncCallbacks,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let snapshot = self.snapshot()?;
        let remote = snapshot.remote.ok_or(SyncError::NoRemoteIdentity)?;

        let pending = self.queued_changes()?;

        if pending.is_empty() {
            // Nothing queued: pull only if another device has synced since
            // we last did.
            let remote_stamp = self
                .tables
                .read_metadata(&remote.spreadsheet_id, metadata_keys::LAST_SYNC_AT)
                .await?
                .and_then(|raw| raw.parse::<i64>().ok());

            let behind = match (remote_stamp, snapshot.last_sync_at) {
                (Some(theirs), Some(ours)) => theirs > ours,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !behind {
                tracing::debug!("Incremental sync: nothing to do");
                return Ok(());
            }
            self.merge_pass(&remote, callbacks, report).await?;
        } else {
            tracing::debug!("Incremental sync: pushing {} queued changes", pending.len());
            let changed_items: Vec<i64> = pending
                .iter()
                .filter(|change| change.entity == EntityKind::Item && change.op != ChangeOp::Delete)
                .map(|change| change.entity_id)
                .collect();
            self.begin_processing(&pending)?;
            let outcome = self
                .push_changed(&remote, &changed_items, callbacks, report)
                .await;
            self.settle_queue(&pending, &outcome)?;
            outcome?;
        }

        self.stamp_success(&remote).await
    }

    /// Resolve the bound spreadsheet, creating and binding one when absent.
    async fn bind_remote(&self) -> SyncResult<RemoteIdentity> {
        let existing = {
            let db = self.db.lock().map_err(poisoned)?;
            SqliteSettingsRepository::new(db.connection()).remote_identity()?
        };
        if let Some(remote) = existing {
            return Ok(remote);
        }

        let remote = self.tables.get_or_create_remote(&self.remote_name).await?;
        let db = self.db.lock().map_err(poisoned)?;
        SqliteSettingsRepository::new(db.connection()).set_remote_identity(&remote)?;
        tracing::info!("Bound remote spreadsheet {}", remote.spreadsheet_id);
        Ok(remote)
    }

    fn snapshot(&self) -> SyncResult<LocalSnapshot> {
        let db = self.db.lock().map_err(poisoned)?;
        let repo = SqliteInventoryRepository::new(db.connection());
        let settings = SqliteSettingsRepository::new(db.connection());
        Ok(LocalSnapshot {
            items: repo.list_items()?,
            categories: repo.list_categories()?,
            locations: repo.list_locations()?,
            last_sync_at: settings.last_sync_at()?,
            remote: settings.remote_identity()?,
            client_id: settings.client_id()?,
        })
    }

    /// Device-to-cloud: photos first, then a full-table overwrite, then
    /// local bookkeeping. Overwrites are idempotent, so a crashed pass can
    /// simply run again.
    async fn push_everything(
        &self,
        remote: &RemoteIdentity,
        callbacks: &dyn SyncCallbacks,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let snapshot = self.snapshot()?;

        for (index, item) in snapshot.items.iter().enumerate() {
            callbacks.on_progress("photos", index + 1, snapshot.items.len());
            if let Err(error) = self.blobs.replace_item_photos(item).await {
                let message = format!("photo upload for item {} failed: {error}", item.id);
                tracing::warn!("{message}");
                report.errors.push(message);
            }
        }

        self.overwrite_tables(remote, &snapshot, report).await?;
        self.mark_local_synced()?;
        Ok(())
    }

    /// Incremental push: only touched items' photo sets are replaced, but
    /// the table overwrite always carries the full local state.
    async fn push_changed(
        &self,
        remote: &RemoteIdentity,
        changed_items: &[i64],
        callbacks: &dyn SyncCallbacks,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let snapshot = self.snapshot()?;

        let touched: Vec<&Item> = snapshot
            .items
            .iter()
            .filter(|item| changed_items.contains(&item.id))
            .collect();
        for (index, item) in touched.iter().enumerate() {
            callbacks.on_progress("photos", index + 1, touched.len());
            if let Err(error) = self.blobs.replace_item_photos(item).await {
                let message = format!("photo upload for item {} failed: {error}", item.id);
                tracing::warn!("{message}");
                report.errors.push(message);
            }
        }

        self.overwrite_tables(remote, &snapshot, report).await?;
        self.mark_local_synced()?;
        Ok(())
    }

    /// Cloud-to-device: decode the remote tables, replace local state
    /// wholesale, then pull photos best-effort.
    async fn pull_everything(
        &self,
        remote: &RemoteIdentity,
        callbacks: &dyn SyncCallbacks,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let (items, categories, locations) = self.read_remote(remote).await?;

        {
            let db = self.db.lock().map_err(poisoned)?;
            let repo = SqliteInventoryRepository::new(db.connection());
            repo.replace_all(&categories, &locations, &items)?;
        }

        for (index, item) in items.iter().enumerate() {
            callbacks.on_progress("photos", index + 1, items.len());
            if let Err(error) = self.blobs.download_item_photos(item).await {
                let message = format!("photo download for item {} failed: {error}", item.id);
                tracing::warn!("{message}");
                report.errors.push(message);
            }
        }

        report.items_synced = items.len();
        report.categories_synced = categories.len();
        report.locations_synced = locations.len();
        Ok(())
    }

    /// Two-way merge: plan against full snapshots, apply remote winners
    /// locally, then push the merged state up.
    async fn merge_pass(
        &self,
        remote: &RemoteIdentity,
        callbacks: &dyn SyncCallbacks,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let (remote_items, remote_categories, remote_locations) = self.read_remote(remote).await?;
        let snapshot = self.snapshot()?;

        let pending_deletes: Vec<i64> = {
            let db = self.db.lock().map_err(poisoned)?;
            SqliteInventoryRepository::new(db.connection())
                .pending_changes()?
                .iter()
                .filter(|change| {
                    change.entity == EntityKind::Item && change.op == ChangeOp::Delete
                })
                .map(|change| change.entity_id)
                .collect()
        };

        let plan = plan_merge(&MergeInput {
            local_items: &snapshot.items,
            remote_items: &remote_items,
            local_categories: &snapshot.categories,
            remote_categories: &remote_categories,
            local_locations: &snapshot.locations,
            remote_locations: &remote_locations,
            last_sync_at: snapshot.last_sync_at,
            pending_deletes: &pending_deletes,
        });

        if !plan.conflicts.is_empty() {
            {
                let now = chrono::Utc::now().timestamp_millis();
                let db = self.db.lock().map_err(poisoned)?;
                let repo = SqliteInventoryRepository::new(db.connection());
                for conflict in &plan.conflicts {
                    repo.record_conflict(conflict, now)?;
                }
            }
            callbacks.on_conflict(&plan.conflicts);
            report.conflicts = plan.conflicts.clone();
        }

        // Remote winners land locally before the push so the overwrite
        // reflects the merged state.
        {
            let db = self.db.lock().map_err(poisoned)?;
            let repo = SqliteInventoryRepository::new(db.connection());
            for category in &plan.add_categories {
                repo.insert_category_if_absent(category)?;
            }
            for location in &plan.add_locations {
                repo.insert_location_if_absent(location)?;
            }
            for item in &plan.apply_remote_items {
                repo.apply_remote_item(item)?;
            }
        }

        for item in &plan.apply_remote_items {
            if let Err(error) = self.blobs.download_item_photos(item).await {
                let message = format!("photo download for item {} failed: {error}", item.id);
                tracing::warn!("{message}");
                report.errors.push(message);
            }
        }

        let merged = self.snapshot()?;
        for id in &plan.upload_items {
            let Some(item) = merged.items.iter().find(|item| item.id == *id) else {
                continue;
            };
            if let Err(error) = self.blobs.replace_item_photos(item).await {
                let message = format!("photo upload for item {} failed: {error}", item.id);
                tracing::warn!("{message}");
                report.errors.push(message);
            }
        }

        self.overwrite_tables(remote, &merged, report).await?;
        self.mark_local_synced()?;
        Ok(())
    }

    async fn read_remote(
        &self,
        remote: &RemoteIdentity,
    ) -> SyncResult<(Vec<Item>, Vec<Category>, Vec<Location>)> {
        let item_rows = self
            .tables
            .read_table(&remote.spreadsheet_id, Table::Items)
            .await?;
        let category_rows = self
            .tables
            .read_table(&remote.spreadsheet_id, Table::Categories)
            .await?;
        let location_rows = self
            .tables
            .read_table(&remote.spreadsheet_id, Table::Locations)
            .await?;

        let items = item_rows
            .iter()
            .map(|row| sheets::item_from_row(row))
            .collect::<TableResult<Vec<_>>>()?;
        let categories = category_rows
            .iter()
            .map(|row| sheets::category_from_row(row))
            .collect::<TableResult<Vec<_>>>()?;
        let locations = location_rows
            .iter()
            .map(|row| sheets::location_from_row(row))
            .collect::<TableResult<Vec<_>>>()?;
        Ok((items, categories, locations))
    }

    async fn overwrite_tables(
        &self,
        remote: &RemoteIdentity,
        snapshot: &LocalSnapshot,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let item_rows: Vec<Vec<String>> = snapshot
            .items
            .iter()
            .map(|item| {
                let mut synced = item.clone();
                synced.sync_status = packrat_core::models::SyncStatus::Synced;
                sheets::item_to_row(&synced)
            })
            .collect();
        let category_rows: Vec<Vec<String>> =
            snapshot.categories.iter().map(sheets::category_to_row).collect();
        let location_rows: Vec<Vec<String>> =
            snapshot.locations.iter().map(sheets::location_to_row).collect();

        self.tables
            .overwrite_table(&remote.spreadsheet_id, Table::Items, item_rows)
            .await?;
        self.tables
            .overwrite_table(&remote.spreadsheet_id, Table::Categories, category_rows)
            .await?;
        self.tables
            .overwrite_table(&remote.spreadsheet_id, Table::Locations, location_rows)
            .await?;

        report.items_synced = snapshot.items.len();
        report.categories_synced = snapshot.categories.len();
        report.locations_synced = snapshot.locations.len();
        Ok(())
    }

    fn mark_local_synced(&self) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().map_err(poisoned)?;
        let repo = SqliteInventoryRepository::new(db.connection());
        repo.mark_items_synced(now)?;
        Ok(())
    }

    fn queued_changes(&self) -> SyncResult<Vec<PendingChange>> {
        let db = self.db.lock().map_err(poisoned)?;
        Ok(SqliteInventoryRepository::new(db.connection()).pending_changes()?)
    }

    /// Move queue rows into `processing` before any remote write, stamping
    /// the attempt time.
    fn begin_processing(&self, changes: &[PendingChange]) -> SyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().map_err(poisoned)?;
        let repo = SqliteInventoryRepository::new(db.connection());
        for change in changes {
            repo.mark_change_processing(change.id, now)?;
        }
        Ok(())
    }

    /// Resolve queue rows after the pass. Completed rows are swept; failed
    /// rows keep the error and stay queryable until a later pass retries
    /// them.
    fn settle_queue(
        &self,
        changes: &[PendingChange],
        outcome: &SyncResult<()>,
    ) -> SyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().map_err(poisoned)?;
        let repo = SqliteInventoryRepository::new(db.connection());
        match outcome {
            Ok(()) => {
                for change in changes {
                    repo.mark_change_completed(change.id)?;
                }
                repo.clear_completed_changes()?;
            }
            Err(error) => {
                let message = error.to_string();
                for change in changes {
                    repo.mark_change_failed(change.id, &message)?;
                }
            }
        }
        Ok(())
    }

    /// Record the successful pass on both sides: local `last_sync_at`,
    /// remote `lastSyncAt` and the writing client's id.
    async fn stamp_success(&self, remote: &RemoteIdentity) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let client_id = {
            let db = self.db.lock().map_err(poisoned)?;
            let settings = SqliteSettingsRepository::new(db.connection());
            settings.set_last_sync_at(now)?;
            settings.client_id()?
        };

        self.tables
            .write_metadata(
                &remote.spreadsheet_id,
                metadata_keys::LAST_SYNC_AT,
                &now.to_string(),
            )
            .await?;
        self.tables
            .write_metadata(&remote.spreadsheet_id, metadata_keys::CLIENT_ID, &client_id)
            .await?;
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> SyncError {
    SyncError::Store(packrat_core::Error::InvalidInput(
        "database lock poisoned".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthResult, TableError};
    use packrat_core::models::{ChangeStatus, SyncStatus};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct FakeToken {
        signed_in: bool,
    }

    #[async_trait::async_trait]
    impl TokenSource for FakeToken {
        async fn token(&self) -> AuthResult<String> {
            if self.signed_in {
                Ok("token".to_string())
            } else {
                Err(AuthError::TokenExpired)
            }
        }
    }

    struct FakeProbe {
        online: bool,
    }

    #[async_trait::async_trait]
    impl ConnectivityProbe for FakeProbe {
        async fn is_online(&self) -> bool {
            self.online
        }
    }

    #[derive(Default)]
    struct FakeTableStore {
        tables: StdMutex<HashMap<&'static str, Vec<Vec<String>>>>,
        metadata: StdMutex<HashMap<String, String>>,
        created: StdMutex<u32>,
        fail_overwrites: StdMutex<bool>,
    }

    #[async_trait::async_trait]
    impl TableStore for FakeTableStore {
        async fn get_or_create_remote(&self, _display_name: &str) -> TableResult<RemoteIdentity> {
            *self.created.lock().unwrap() += 1;
            Ok(RemoteIdentity {
                spreadsheet_id: "sheet-1".to_string(),
                url: "https://example.com/sheet-1".to_string(),
            })
        }

        async fn read_table(
            &self,
            _spreadsheet_id: &str,
            table: Table,
        ) -> TableResult<Vec<Vec<String>>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .get(table.title())
                .cloned()
                .unwrap_or_default())
        }

        async fn overwrite_table(
            &self,
            _spreadsheet_id: &str,
            table: Table,
            rows: Vec<Vec<String>>,
        ) -> TableResult<()> {
            if *self.fail_overwrites.lock().unwrap() {
                return Err(TableError::RateLimited);
            }
            self.tables.lock().unwrap().insert(table.title(), rows);
            Ok(())
        }

        async fn read_metadata(
            &self,
            _spreadsheet_id: &str,
            key: &str,
        ) -> TableResult<Option<String>> {
            Ok(self.metadata.lock().unwrap().get(key).cloned())
        }

        async fn write_metadata(
            &self,
            _spreadsheet_id: &str,
            key: &str,
            value: &str,
        ) -> TableResult<()> {
            self.metadata
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBlobStore {
        uploads: StdMutex<Vec<i64>>,
        downloads: StdMutex<Vec<i64>>,
    }

    #[async_trait::async_trait]
    impl BlobStore for FakeBlobStore {
        async fn replace_item_photos(&self, item: &Item) -> BlobResult<u32> {
            self.uploads.lock().unwrap().push(item.id);
            Ok(u32::try_from(item.photos.len()).unwrap_or(0))
        }

        async fn download_item_photos(&self, item: &Item) -> BlobResult<u32> {
            self.downloads.lock().unwrap().push(item.id);
            Ok(u32::try_from(item.photos.len()).unwrap_or(0))
        }
    }

    struct Harness {
        engine: SyncEngine,
        tables: Arc<FakeTableStore>,
        blobs: Arc<FakeBlobStore>,
        db: Arc<StdMutex<Database>>,
    }

    fn harness(online: bool, signed_in: bool) -> Harness {
        let db = Arc::new(StdMutex::new(Database::open_in_memory().unwrap()));
        let tables = Arc::new(FakeTableStore::default());
        let blobs = Arc::new(FakeBlobStore::default());
        let engine = SyncEngine::new(
            Arc::clone(&db),
            Arc::clone(&tables) as Arc<dyn TableStore>,
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
            Arc::new(FakeProbe { online }),
            Arc::new(FakeToken { signed_in }),
            "My Inventory",
        );
        Harness {
            engine,
            tables,
            blobs,
            db,
        }
    }

    fn add_item(db: &StdMutex<Database>, name: &str) -> Item {
        let guard = db.lock().unwrap();
        let repo = SqliteInventoryRepository::new(guard.connection());
        repo.create_item(&Item::new(name, "General", "Home")).unwrap()
    }

    #[tokio::test]
    async fn offline_pass_is_skipped_without_error() {
        let h = harness(false, true);
        let report = h
            .engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();

        assert_eq!(report, SyncReport::default());
        assert_eq!(h.engine.status().unwrap().status, SyncPhase::Offline);
        assert_eq!(*h.tables.created.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn signed_out_pass_fails_with_not_signed_in() {
        struct Capture {
            statuses: StdMutex<Vec<SyncPhase>>,
            errors: StdMutex<Vec<String>>,
        }
        impl SyncCallbacks for Capture {
            fn on_status(&self, status: SyncPhase) {
                self.statuses.lock().unwrap().push(status);
            }
            fn on_error(&self, message: &str) {
                self.errors.lock().unwrap().push(message.to_string());
            }
        }

        let h = harness(true, false);
        let capture = Capture {
            statuses: StdMutex::new(Vec::new()),
            errors: StdMutex::new(Vec::new()),
        };
        let error = h.engine.incremental_sync(&capture).await.unwrap_err();
        assert!(matches!(error, SyncError::NotSignedIn));
        assert_eq!(h.engine.status().unwrap().status, SyncPhase::Error);

        // The failure is surfaced through the same notification path as
        // any other failed pass.
        assert_eq!(capture.statuses.lock().unwrap().as_slice(), &[SyncPhase::Error]);
        assert_eq!(capture.errors.lock().unwrap().as_slice(), &["Not signed in".to_string()]);
    }

    #[tokio::test]
    async fn device_to_cloud_is_idempotent() {
        let h = harness(true, true);
        add_item(&h.db, "Drill");
        add_item(&h.db, "Ladder");

        let first = h
            .engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();
        let rows_after_first = h.tables.tables.lock().unwrap().clone();

        let second = h
            .engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();
        let rows_after_second = h.tables.tables.lock().unwrap().clone();

        assert_eq!(first.items_synced, 2);
        assert_eq!(second.items_synced, 2);
        assert_eq!(rows_after_first, rows_after_second);

        let state = h.engine.status().unwrap();
        assert_eq!(state.status, SyncPhase::Success);
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_at.is_some());
        assert!(state.remote.is_some());

        // The spreadsheet was bound once, then reused.
        assert_eq!(*h.tables.created.lock().unwrap(), 1);

        let guard = h.db.lock().unwrap();
        let repo = SqliteInventoryRepository::new(guard.connection());
        assert!(repo
            .list_items()
            .unwrap()
            .iter()
            .all(|item| item.sync_status == SyncStatus::Synced));
    }

    #[tokio::test]
    async fn device_to_cloud_writes_metadata_stamps() {
        let h = harness(true, true);
        add_item(&h.db, "Drill");

        h.engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();

        let metadata = h.tables.metadata.lock().unwrap();
        assert!(metadata.contains_key(metadata_keys::LAST_SYNC_AT));
        assert!(metadata.contains_key(metadata_keys::CLIENT_ID));
    }

    #[tokio::test]
    async fn cloud_to_device_replaces_local_state() {
        let h = harness(true, true);
        add_item(&h.db, "LocalOnly");

        // Seed the fake remote with one item and one category.
        let mut remote_item = Item::new("Tent", "Camping", "Garage");
        remote_item.id = 11;
        remote_item.updated_at = 5_000;
        remote_item.created_at = 5_000;
        h.tables.tables.lock().unwrap().insert(
            Table::Items.title(),
            vec![sheets::item_to_row(&remote_item)],
        );
        h.tables.tables.lock().unwrap().insert(
            Table::Categories.title(),
            vec![sheets::category_to_row(&Category {
                id: 1,
                name: "Camping".to_string(),
                color: None,
                created_at: 0,
            })],
        );

        let report = h
            .engine
            .initial_sync(SyncDirection::CloudToDevice, &NoCallbacks)
            .await
            .unwrap();

        assert_eq!(report.items_synced, 1);
        assert_eq!(h.blobs.downloads.lock().unwrap().as_slice(), &[11]);

        let guard = h.db.lock().unwrap();
        let repo = SqliteInventoryRepository::new(guard.connection());
        let items = repo.list_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Tent");
        assert_eq!(repo.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn incremental_without_remote_identity_fails() {
        let h = harness(true, true);
        let error = h.engine.incremental_sync(&NoCallbacks).await.unwrap_err();
        assert!(matches!(error, SyncError::NoRemoteIdentity));
    }

    #[tokio::test]
    async fn incremental_pushes_queued_changes_and_clears_queue() {
        let h = harness(true, true);
        h.engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();

        let item = add_item(&h.db, "Rope");
        let report = h.engine.incremental_sync(&NoCallbacks).await.unwrap();

        assert_eq!(report.items_synced, 1);
        assert!(h.blobs.uploads.lock().unwrap().contains(&item.id));

        let state = h.engine.status().unwrap();
        assert_eq!(state.pending_changes, 0);

        // The pushed row is in the fake remote.
        let tables = h.tables.tables.lock().unwrap();
        let rows = tables.get(Table::Items.title()).unwrap();
        assert!(rows.iter().any(|row| row[1] == "Rope"));
    }

    #[tokio::test]
    async fn failed_push_leaves_queue_rows_failed_with_the_error() {
        let h = harness(true, true);
        h.engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();

        add_item(&h.db, "Rope");
        *h.tables.fail_overwrites.lock().unwrap() = true;

        let error = h.engine.incremental_sync(&NoCallbacks).await.unwrap_err();
        assert!(matches!(error, SyncError::Table(TableError::RateLimited)));

        {
            let guard = h.db.lock().unwrap();
            let repo = SqliteInventoryRepository::new(guard.connection());
            let changes = repo.pending_changes().unwrap();
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].status, ChangeStatus::Failed);
            assert!(changes[0]
                .error
                .as_deref()
                .unwrap()
                .contains("Rate limited"));
            assert!(changes[0].attempted_at.is_some());
        }

        // The next pass picks the failed rows back up and completes them.
        *h.tables.fail_overwrites.lock().unwrap() = false;
        h.engine.incremental_sync(&NoCallbacks).await.unwrap();

        let guard = h.db.lock().unwrap();
        let repo = SqliteInventoryRepository::new(guard.connection());
        assert_eq!(repo.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn incremental_with_empty_queue_and_stale_remote_is_a_noop() {
        let h = harness(true, true);
        h.engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();
        let stamp_before = h.tables.metadata.lock().unwrap().clone();

        let report = h.engine.incremental_sync(&NoCallbacks).await.unwrap();
        assert_eq!(report.items_synced, 0);

        // A no-op finishes as success without touching the remote stamps.
        assert_eq!(h.engine.status().unwrap().status, SyncPhase::Success);
        let stamp_after = h.tables.metadata.lock().unwrap().clone();
        assert_eq!(stamp_after, stamp_before);
    }

    #[tokio::test]
    async fn incremental_pulls_when_remote_is_newer() {
        let h = harness(true, true);
        h.engine
            .initial_sync(SyncDirection::DeviceToCloud, &NoCallbacks)
            .await
            .unwrap();

        // Another device appended an item and bumped the remote stamp.
        let mut remote_item = Item::new("Tarp", "Camping", "Garage");
        remote_item.id = 42;
        remote_item.created_at = 1;
        remote_item.updated_at = chrono::Utc::now().timestamp_millis() + 60_000;
        h.tables.tables.lock().unwrap().insert(
            Table::Items.title(),
            vec![sheets::item_to_row(&remote_item)],
        );
        h.tables.metadata.lock().unwrap().insert(
            metadata_keys::LAST_SYNC_AT.to_string(),
            i64::MAX.to_string(),
        );

        h.engine.incremental_sync(&NoCallbacks).await.unwrap();

        let guard = h.db.lock().unwrap();
        let repo = SqliteInventoryRepository::new(guard.connection());
        assert!(repo
            .list_items()
            .unwrap()
            .iter()
            .any(|item| item.name == "Tarp"));
    }

    #[tokio::test]
    async fn merge_reports_and_records_conflicts() {
        struct Capture {
            conflicts: StdMutex<usize>,
        }
        impl SyncCallbacks for Capture {
            fn on_conflict(&self, conflicts: &[Conflict]) {
                *self.conflicts.lock().unwrap() += conflicts.len();
            }
        }

        let h = harness(true, true);
        let local = add_item(&h.db, "Drill");

        // Remote has the same item, edited later.
        let mut remote_item = local.clone();
        remote_item.quantity = 99;
        remote_item.updated_at = local.updated_at + 10_000;
        h.tables.tables.lock().unwrap().insert(
            Table::Items.title(),
            vec![sheets::item_to_row(&remote_item)],
        );
        // Pretend we synced before either edit.
        {
            let guard = h.db.lock().unwrap();
            SqliteSettingsRepository::new(guard.connection())
                .set_last_sync_at(local.updated_at - 60_000)
                .unwrap();
        }

        let capture = Capture {
            conflicts: StdMutex::new(0),
        };
        let report = h
            .engine
            .initial_sync(SyncDirection::Merge, &capture)
            .await
            .unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(*capture.conflicts.lock().unwrap(), 1);

        let guard = h.db.lock().unwrap();
        let repo = SqliteInventoryRepository::new(guard.connection());
        // Remote won; the local row now carries the remote quantity.
        assert_eq!(repo.get_item(local.id).unwrap().unwrap().quantity, 99);
        assert_eq!(repo.list_conflicts(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_concurrent_pass_is_rejected() {
        let h = harness(true, true);
        let guard = h.engine.pass_guard.lock().await;

        let error = h.engine.incremental_sync(&NoCallbacks).await.unwrap_err();
        assert!(matches!(error, SyncError::AlreadyRunning));
        drop(guard);
    }
}
