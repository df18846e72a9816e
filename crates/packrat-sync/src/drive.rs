//! Photo blob store adapter.
//!
//! Photos live as individual files in a `photos` subfolder of the app
//! folder. File names are the stable references stored in item rows, so a
//! blob can be re-found from a spreadsheet cell alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::{multipart, Client, Method, StatusCode};
use serde_json::json;
use tokio::sync::Mutex;

use packrat_core::models::Item;

use crate::auth::{parse_api_error, TokenSource};
use crate::engine::BlobStore;
use crate::error::{BlobError, BlobResult};

const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const APP_FOLDER_NAME: &str = "Packrat";
const PHOTOS_FOLDER_NAME: &str = "photos";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Remote storage quota snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageQuota {
    /// Total bytes available; `None` for unlimited plans.
    pub limit: Option<i64>,
    pub used: i64,
}

/// Raw blob operations the photo store is built on.
#[async_trait::async_trait]
pub trait BlobTransport: Send + Sync {
    /// Upload bytes under `name`, returning the stored reference.
    async fn upload(&self, name: &str, bytes: Vec<u8>, mime: &str) -> BlobResult<String>;
    async fn download(&self, name: &str) -> BlobResult<Vec<u8>>;
    async fn delete(&self, name: &str) -> BlobResult<()>;
    /// Names of every blob belonging to an item.
    async fn list_for_item(&self, item_id: i64) -> BlobResult<Vec<String>>;
    async fn quota(&self) -> BlobResult<StorageQuota>;
}

/// Build the blob name for a new item photo.
#[must_use]
pub fn blob_name(item_id: i64, extension: &str) -> String {
    let ext = sanitize_extension(extension);
    let id = uuid::Uuid::now_v7();
    format!("item-{item_id}-{id}.{ext}")
}

/// Prefix shared by every photo of an item.
#[must_use]
pub fn item_prefix(item_id: i64) -> String {
    format!("item-{item_id}-")
}

fn sanitize_extension(extension: &str) -> String {
    let cleaned: String = extension
        .trim()
        .trim_start_matches('.')
        .chars()
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if cleaned.is_empty() {
        "jpg".to_string()
    } else {
        cleaned
    }
}

fn mime_for_extension(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// A 403 from the blob store either means quota or a real permission
/// problem; the response body disambiguates.
fn classify_forbidden(body: &str) -> BlobError {
    if body.contains("storageQuotaExceeded") || body.contains("quotaExceeded") {
        BlobError::QuotaExceeded
    } else {
        BlobError::PermissionDenied
    }
}

fn parse_quota(payload: &serde_json::Value) -> BlobResult<StorageQuota> {
    let quota = &payload["storageQuota"];
    let used = quota["usage"]
        .as_str()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| BlobError::InvalidResponse("quota response missing usage".to_string()))?;
    let limit = quota["limit"].as_str().and_then(|raw| raw.parse().ok());
    Ok(StorageQuota { limit, used })
}

/// HTTP client for the blob store, with a lazily resolved folder cache.
pub struct DriveClient {
    client: Client,
    api_base: String,
    token: Arc<dyn TokenSource>,
    /// Resolved `photos` folder id, populated on first use.
    photos_folder: Mutex<Option<String>>,
}

impl DriveClient {
    pub fn new(token: Arc<dyn TokenSource>) -> BlobResult<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            api_base: DRIVE_API_BASE.to_string(),
            token,
            photos_folder: Mutex::new(None),
        })
    }

    /// Point the client at a different host. Test seam.
    #[must_use]
    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Resolve (and cache) the photos folder id, creating the folder chain
    /// on first use.
    async fn photos_folder_id(&self) -> BlobResult<String> {
        let mut cached = self.photos_folder.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let app_id = self.find_or_create_folder(APP_FOLDER_NAME, None).await?;
        let photos_id = self
            .find_or_create_folder(PHOTOS_FOLDER_NAME, Some(&app_id))
            .await?;
        *cached = Some(photos_id.clone());
        Ok(photos_id)
    }

    async fn find_or_create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> BlobResult<String> {
        let mut query =
            format!("name = '{name}' and mimeType = '{FOLDER_MIME}' and trashed = false");
        if let Some(parent) = parent {
            query.push_str(&format!(" and '{parent}' in parents"));
        }

        let found = self.get_json(&files_query_url(&self.api_base, &query)).await?;
        if let Some(id) = found["files"][0]["id"].as_str() {
            return Ok(id.to_string());
        }

        let mut body = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            body["parents"] = json!([parent]);
        }
        let created = self
            .send_json(
                Method::POST,
                &format!("{}/drive/v3/files", self.api_base),
                Some(body),
            )
            .await?;
        created["id"].as_str().map(str::to_string).ok_or_else(|| {
            BlobError::InvalidResponse("folder create response missing id".to_string())
        })
    }

    async fn find_by_name(&self, name: &str) -> BlobResult<Option<String>> {
        let folder = self.photos_folder_id().await?;
        let query = format!(
            "name = '{}' and '{folder}' in parents and trashed = false",
            name.replace('\'', "\\'")
        );
        let found = self.get_json(&files_query_url(&self.api_base, &query)).await?;
        Ok(found["files"][0]["id"].as_str().map(str::to_string))
    }

    async fn get_json(&self, url: &str) -> BlobResult<serde_json::Value> {
        self.send_json(Method::GET, url, None).await
    }

    async fn send_json(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> BlobResult<serde_json::Value> {
        let token = self.token.token().await?;
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        self.check_status(url, response).await?.json().await.map_err(Into::into)
    }

    async fn check_status(
        &self,
        context: &str,
        response: reqwest::Response,
    ) -> BlobResult<reqwest::Response> {
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Err(BlobError::NotFound(context.to_string())),
            StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_forbidden(&body))
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(BlobError::InvalidResponse(parse_api_error(status, &body)))
            }
            _ => Ok(response),
        }
    }
}

#[async_trait::async_trait]
impl BlobTransport for DriveClient {
    async fn upload(&self, name: &str, bytes: Vec<u8>, mime: &str) -> BlobResult<String> {
        let folder = self.photos_folder_id().await?;
        let token = self.token.token().await?;

        let metadata = json!({ "name": name, "parents": [folder] }).to_string();
        let form = multipart::Form::new()
            .part(
                "metadata",
                multipart::Part::text(metadata)
                    .mime_str("application/json")
                    .map_err(|error| BlobError::UploadFailed(error.to_string()))?,
            )
            .part(
                "file",
                multipart::Part::bytes(bytes)
                    .mime_str(mime)
                    .map_err(|error| BlobError::UploadFailed(error.to_string()))?,
            );

        let response = self
            .client
            .post(format!(
                "{}/upload/drive/v3/files?uploadType=multipart",
                self.api_base
            ))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;

        self.check_status(name, response).await?;
        Ok(name.to_string())
    }

    async fn download(&self, name: &str) -> BlobResult<Vec<u8>> {
        let id = self
            .find_by_name(name)
            .await?
            .ok_or_else(|| BlobError::NotFound(name.to_string()))?;
        let token = self.token.token().await?;

        let response = self
            .client
            .get(format!("{}/drive/v3/files/{id}?alt=media", self.api_base))
            .bearer_auth(token)
            .send()
            .await?;

        let response = self.check_status(name, response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn delete(&self, name: &str) -> BlobResult<()> {
        let Some(id) = self.find_by_name(name).await? else {
            // Already gone; deletion is idempotent.
            return Ok(());
        };
        let token = self.token.token().await?;

        let response = self
            .client
            .delete(format!("{}/drive/v3/files/{id}", self.api_base))
            .bearer_auth(token)
            .send()
            .await?;
        self.check_status(name, response).await?;
        Ok(())
    }

    async fn list_for_item(&self, item_id: i64) -> BlobResult<Vec<String>> {
        let folder = self.photos_folder_id().await?;
        let prefix = item_prefix(item_id);
        let query = format!(
            "name contains '{prefix}' and '{folder}' in parents and trashed = false"
        );
        let found = self.get_json(&files_query_url(&self.api_base, &query)).await?;

        Ok(found["files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|file| file["name"].as_str())
                    // `contains` matches anywhere in the name; keep true
                    // prefix matches only.
                    .filter(|name| name.starts_with(&prefix))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn quota(&self) -> BlobResult<StorageQuota> {
        let payload = self
            .get_json(&format!(
                "{}/drive/v3/about?fields=storageQuota",
                self.api_base
            ))
            .await?;
        parse_quota(&payload)
    }
}

fn files_query_url(api_base: &str, query: &str) -> String {
    format!(
        "{api_base}/drive/v3/files?q={}&fields=files(id,name)",
        crate::sheets::urlencode(query)
    )
}

/// Photo store bridging local photo files and the remote blob transport.
///
/// All batch operations are best-effort: one bad photo is logged and
/// skipped, never aborting the batch.
pub struct DrivePhotoStore<T: BlobTransport> {
    transport: T,
    photos_dir: PathBuf,
}

impl<T: BlobTransport> DrivePhotoStore<T> {
    pub fn new(transport: T, photos_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            photos_dir: photos_dir.into(),
        }
    }

    fn local_path(&self, name: &str) -> PathBuf {
        // Refs come from remote rows; never let one escape the photos dir.
        let file_name = Path::new(name)
            .file_name()
            .map_or_else(|| name.to_string(), |n| n.to_string_lossy().into_owned());
        self.photos_dir.join(file_name)
    }
}

#[async_trait::async_trait]
impl<T: BlobTransport> BlobStore for DrivePhotoStore<T> {
    async fn replace_item_photos(&self, item: &Item) -> BlobResult<u32> {
        let existing = self.transport.list_for_item(item.id).await?;

        // Remove remote blobs the item no longer references.
        for stale in existing.iter().filter(|name| !item.photos.contains(name)) {
            if let Err(error) = self.transport.delete(stale).await {
                tracing::warn!("Failed to delete stale photo {stale}: {error}");
            }
        }

        let mut uploaded = 0;
        for name in item.photos.iter().filter(|name| !existing.contains(name)) {
            let bytes = match tokio::fs::read(self.local_path(name)).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!("Skipping photo {name}: local file unreadable: {error}");
                    continue;
                }
            };
            match self
                .transport
                .upload(name, bytes, mime_for_extension(name))
                .await
            {
                Ok(_) => uploaded += 1,
                Err(error) => {
                    tracing::warn!("Failed to upload photo {name}: {error}");
                }
            }
        }
        Ok(uploaded)
    }

    async fn download_item_photos(&self, item: &Item) -> BlobResult<u32> {
        if !item.photos.is_empty() {
            tokio::fs::create_dir_all(&self.photos_dir).await?;
        }

        let mut downloaded = 0;
        for name in &item.photos {
            let path = self.local_path(name);
            if path.exists() {
                continue;
            }
            match self.transport.download(name).await {
                Ok(bytes) => {
                    if let Err(error) = tokio::fs::write(&path, bytes).await {
                        tracing::warn!("Failed to store photo {name}: {error}");
                    } else {
                        downloaded += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!("Failed to download photo {name}: {error}");
                }
            }
        }
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn blob_name_carries_item_prefix_and_extension() {
        let name = blob_name(42, "JPG");
        assert!(name.starts_with("item-42-"));
        assert!(name.ends_with(".jpg"));
        assert!(name.starts_with(&item_prefix(42)));
    }

    #[test]
    fn blob_names_are_unique_per_call() {
        assert_ne!(blob_name(1, "png"), blob_name(1, "png"));
    }

    #[test]
    fn sanitize_extension_strips_oddities() {
        assert_eq!(sanitize_extension(".PNG"), "png");
        assert_eq!(sanitize_extension("jp eg!"), "jpeg");
        assert_eq!(sanitize_extension("  "), "jpg");
    }

    #[test]
    fn forbidden_classification_detects_quota() {
        assert!(matches!(
            classify_forbidden(r#"{"error":{"errors":[{"reason":"storageQuotaExceeded"}]}}"#),
            BlobError::QuotaExceeded
        ));
        assert!(matches!(
            classify_forbidden(r#"{"error":{"message":"insufficient scopes"}}"#),
            BlobError::PermissionDenied
        ));
    }

    #[test]
    fn quota_parses_numeric_strings() {
        let payload = serde_json::json!({
            "storageQuota": { "limit": "1000000", "usage": "250" }
        });
        let quota = parse_quota(&payload).unwrap();
        assert_eq!(quota.limit, Some(1_000_000));
        assert_eq!(quota.used, 250);

        let unlimited = serde_json::json!({ "storageQuota": { "usage": "250" } });
        assert_eq!(parse_quota(&unlimited).unwrap().limit, None);
    }

    /// In-memory transport that can be told to fail specific names.
    #[derive(Default)]
    struct FakeTransport {
        blobs: StdMutex<HashMap<String, Vec<u8>>>,
        fail_names: Vec<String>,
    }

    #[async_trait::async_trait]
    impl BlobTransport for FakeTransport {
        async fn upload(&self, name: &str, bytes: Vec<u8>, _mime: &str) -> BlobResult<String> {
            if self.fail_names.iter().any(|n| n == name) {
                return Err(BlobError::UploadFailed("injected failure".to_string()));
            }
            self.blobs.lock().unwrap().insert(name.to_string(), bytes);
            Ok(name.to_string())
        }

        async fn download(&self, name: &str) -> BlobResult<Vec<u8>> {
            self.blobs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(name.to_string()))
        }

        async fn delete(&self, name: &str) -> BlobResult<()> {
            self.blobs.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_for_item(&self, item_id: i64) -> BlobResult<Vec<String>> {
            let prefix = item_prefix(item_id);
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .keys()
                .filter(|name| name.starts_with(&prefix))
                .cloned()
                .collect())
        }

        async fn quota(&self) -> BlobResult<StorageQuota> {
            Ok(StorageQuota {
                limit: None,
                used: 0,
            })
        }
    }

    fn item_with_photos(id: i64, photos: &[&str]) -> Item {
        let mut item = Item::new("Camera", "Electronics", "Office");
        item.id = id;
        item.photos = photos.iter().map(|s| (*s).to_string()).collect();
        item
    }

    #[tokio::test]
    async fn one_failed_upload_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["item-1-a.jpg", "item-1-b.jpg", "item-1-c.jpg"] {
            std::fs::write(dir.path().join(name), b"photo").unwrap();
        }

        let transport = FakeTransport {
            fail_names: vec!["item-1-b.jpg".to_string()],
            ..FakeTransport::default()
        };
        let store = DrivePhotoStore::new(transport, dir.path());

        let item = item_with_photos(1, &["item-1-a.jpg", "item-1-b.jpg", "item-1-c.jpg"]);
        let uploaded = store.replace_item_photos(&item).await.unwrap();

        assert_eq!(uploaded, 2);
        let blobs = store.transport.blobs.lock().unwrap();
        assert!(blobs.contains_key("item-1-a.jpg"));
        assert!(!blobs.contains_key("item-1-b.jpg"));
        assert!(blobs.contains_key("item-1-c.jpg"));
    }

    #[tokio::test]
    async fn replace_deletes_stale_remote_photos() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("item-2-new.jpg"), b"photo").unwrap();

        let transport = FakeTransport::default();
        transport
            .blobs
            .lock()
            .unwrap()
            .insert("item-2-old.jpg".to_string(), b"stale".to_vec());
        let store = DrivePhotoStore::new(transport, dir.path());

        let item = item_with_photos(2, &["item-2-new.jpg"]);
        store.replace_item_photos(&item).await.unwrap();

        let blobs = store.transport.blobs.lock().unwrap();
        assert!(!blobs.contains_key("item-2-old.jpg"));
        assert!(blobs.contains_key("item-2-new.jpg"));
    }

    #[tokio::test]
    async fn missing_local_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("item-3-real.jpg"), b"photo").unwrap();

        let store = DrivePhotoStore::new(FakeTransport::default(), dir.path());
        let item = item_with_photos(3, &["item-3-missing.jpg", "item-3-real.jpg"]);

        let uploaded = store.replace_item_photos(&item).await.unwrap();
        assert_eq!(uploaded, 1);
    }

    #[tokio::test]
    async fn download_skips_present_files_and_missing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("item-4-here.jpg"), b"already local").unwrap();

        let transport = FakeTransport::default();
        transport
            .blobs
            .lock()
            .unwrap()
            .insert("item-4-remote.jpg".to_string(), b"from cloud".to_vec());
        let store = DrivePhotoStore::new(transport, dir.path());

        let item = item_with_photos(
            4,
            &["item-4-here.jpg", "item-4-remote.jpg", "item-4-gone.jpg"],
        );
        let downloaded = store.download_item_photos(&item).await.unwrap();

        assert_eq!(downloaded, 1);
        assert_eq!(
            std::fs::read(dir.path().join("item-4-remote.jpg")).unwrap(),
            b"from cloud"
        );
        // The pre-existing local file was not clobbered.
        assert_eq!(
            std::fs::read(dir.path().join("item-4-here.jpg")).unwrap(),
            b"already local"
        );
    }
}
