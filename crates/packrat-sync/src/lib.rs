//! Cloud synchronization for Packrat.
//!
//! Pulls the pieces together: OAuth token management, the spreadsheet-backed
//! table adapter, the photo blob adapter, the merge-capable sync engine, and
//! the background scheduler.

pub mod auth;
pub mod drive;
pub mod engine;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod sheets;

pub use auth::{
    AuthConfig, AuthFlowState, CredentialStore, Credentials, SqliteCredentialStore, TokenManager,
    TokenSource,
};
pub use drive::{BlobTransport, DriveClient, DrivePhotoStore, StorageQuota};
pub use engine::{
    BlobStore, ConnectivityProbe, HttpConnectivityProbe, NoCallbacks, SyncCallbacks, SyncDirection,
    SyncEngine, SyncReport, TableStore,
};
pub use error::{AuthError, BlobError, SyncError, TableError};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, SyncRunner, SyncScheduler};
pub use sheets::{SheetsClient, Table};
