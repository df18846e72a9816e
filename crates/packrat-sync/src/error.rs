//! Error families for the sync crate
//!
//! One closed enum per adapter concern so callers can match on the failure
//! class without string inspection.

use thiserror::Error;

/// Token manager failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid auth configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Authorization failed: {0}")]
    AuthFailed(String),
    #[error("No valid credentials; sign-in required")]
    TokenExpired,
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),
    #[error("Token revocation failed: {0}")]
    RevokeFailed(String),
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Failed to parse JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Credential storage error: {0}")]
    Storage(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Tabular store adapter failures.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Remote table not found: {0}")]
    NotFound(String),
    #[error("Permission denied by remote table store")]
    PermissionDenied,
    #[error("Rate limited by remote table store")]
    RateLimited,
    #[error("Remote table edit conflict: {0}")]
    Conflict(String),
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Unexpected table store response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub type TableResult<T> = Result<T, TableError>;

/// Blob store adapter failures.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Remote blob not found: {0}")]
    NotFound(String),
    #[error("Permission denied by remote blob store")]
    PermissionDenied,
    #[error("Remote storage quota exceeded")]
    QuotaExceeded,
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Unexpected blob store response: {0}")]
    InvalidResponse(String),
    #[error("Blob upload failed: {0}")]
    UploadFailed(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("Local photo file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Sync engine and scheduler failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not signed in")]
    NotSignedIn,
    #[error("No remote spreadsheet is bound; run an initial sync first")]
    NoRemoteIdentity,
    #[error("A sync pass is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("Local store error: {0}")]
    Store(#[from] packrat_core::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
