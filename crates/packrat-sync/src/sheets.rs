//! Spreadsheet-backed tabular store adapter.
//!
//! The remote side of sync is four fixed-schema sheets inside one
//! spreadsheet. Rows are plain string cells; the codecs here are pure so
//! the wire format can be tested without a network.

use std::sync::Arc;

use reqwest::{Client, Method, StatusCode};
use serde_json::json;

use packrat_core::models::{Category, Item, Location, RemoteIdentity, SyncStatus};
use packrat_core::util::unix_timestamp_ms;

use crate::auth::{parse_api_error, TokenSource};
use crate::error::{TableError, TableResult};
use crate::retry::{parse_retry_after, RetryDecision, RetryPolicy, Sleeper, TokioSleeper};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";
const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const SPREADSHEET_URL_BASE: &str = "https://docs.google.com/spreadsheets/d";

/// Metadata keys written by the sync engine.
pub mod metadata_keys {
    pub const LAST_SYNC_AT: &str = "lastSyncAt";
    pub const CLIENT_ID: &str = "clientId";
    pub const SCHEMA_VERSION: &str = "schemaVersion";
}

/// The four fixed remote tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Items,
    Categories,
    Locations,
    Metadata,
}

impl Table {
    pub const ALL: [Self; 4] = [Self::Items, Self::Categories, Self::Locations, Self::Metadata];

    /// Sheet title inside the spreadsheet.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Items => "Items",
            Self::Categories => "Categories",
            Self::Locations => "Locations",
            Self::Metadata => "Metadata",
        }
    }

    /// Ordered header row. Validated on every read and rewritten on every
    /// overwrite.
    #[must_use]
    pub const fn headers(self) -> &'static [&'static str] {
        match self {
            Self::Items => &[
                "ID",
                "Name",
                "Barcode",
                "Quantity",
                "MinQuantity",
                "Category",
                "Location",
                "Notes",
                "PhotoRefs",
                "CreatedAt",
                "UpdatedAt",
                "SyncStatus",
            ],
            Self::Categories => &["ID", "Name", "Color", "CreatedAt"],
            Self::Locations => &["ID", "Name", "Description", "CreatedAt"],
            Self::Metadata => &["Key", "Value", "UpdatedAt"],
        }
    }
}

// ---------------------------------------------------------------------------
// Row codecs. `None` maps to the empty cell in both directions; photo refs
// share one cell, `;`-separated.

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map_or("", String::as_str)
}

fn parse_i64(row: &[String], index: usize, table: Table) -> TableResult<i64> {
    let raw = cell(row, index);
    raw.trim().parse().map_err(|_| {
        TableError::InvalidResponse(format!(
            "{} row has non-numeric {}: {raw:?}",
            table.title(),
            table.headers()[index]
        ))
    })
}

fn optional_cell(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[must_use]
pub fn item_to_row(item: &Item) -> Vec<String> {
    vec![
        item.id.to_string(),
        item.name.clone(),
        item.barcode.clone().unwrap_or_default(),
        item.quantity.to_string(),
        item.min_quantity.map(|v| v.to_string()).unwrap_or_default(),
        item.category.clone(),
        item.location.clone(),
        item.notes.clone(),
        item.photos.join(";"),
        item.created_at.to_string(),
        item.updated_at.to_string(),
        item.sync_status.as_str().to_string(),
    ]
}

pub fn item_from_row(row: &[String]) -> TableResult<Item> {
    let photos_cell = cell(row, 8);
    let photos = if photos_cell.trim().is_empty() {
        Vec::new()
    } else {
        photos_cell.split(';').map(str::to_string).collect()
    };

    Ok(Item {
        id: parse_i64(row, 0, Table::Items)?,
        name: cell(row, 1).to_string(),
        barcode: optional_cell(cell(row, 2)),
        quantity: parse_i64(row, 3, Table::Items)?,
        min_quantity: optional_cell(cell(row, 4))
            .map(|raw| {
                raw.parse().map_err(|_| {
                    TableError::InvalidResponse(format!(
                        "Items row has non-numeric MinQuantity: {raw:?}"
                    ))
                })
            })
            .transpose()?,
        category: cell(row, 5).to_string(),
        location: cell(row, 6).to_string(),
        notes: cell(row, 7).to_string(),
        photos,
        created_at: parse_i64(row, 9, Table::Items)?,
        updated_at: parse_i64(row, 10, Table::Items)?,
        sync_status: cell(row, 11).parse().unwrap_or(SyncStatus::Synced),
        synced_at: None,
    })
}

#[must_use]
pub fn category_to_row(category: &Category) -> Vec<String> {
    vec![
        category.id.to_string(),
        category.name.clone(),
        category.color.clone().unwrap_or_default(),
        category.created_at.to_string(),
    ]
}

pub fn category_from_row(row: &[String]) -> TableResult<Category> {
    Ok(Category {
        id: parse_i64(row, 0, Table::Categories)?,
        name: cell(row, 1).to_string(),
        color: optional_cell(cell(row, 2)),
        created_at: parse_i64(row, 3, Table::Categories)?,
    })
}

#[must_use]
pub fn location_to_row(location: &Location) -> Vec<String> {
    vec![
        location.id.to_string(),
        location.name.clone(),
        location.description.clone().unwrap_or_default(),
        location.created_at.to_string(),
    ]
}

pub fn location_from_row(row: &[String]) -> TableResult<Location> {
    Ok(Location {
        id: parse_i64(row, 0, Table::Locations)?,
        name: cell(row, 1).to_string(),
        description: optional_cell(cell(row, 2)),
        created_at: parse_i64(row, 3, Table::Locations)?,
    })
}

/// Check that a sheet's first row matches the expected headers.
pub fn validate_headers(table: Table, first_row: Option<&[String]>) -> TableResult<()> {
    let expected = table.headers();
    let matches = first_row.is_some_and(|row| {
        row.len() >= expected.len()
            && row
                .iter()
                .zip(expected.iter())
                .all(|(cell, header)| cell.trim() == *header)
    });

    if matches {
        Ok(())
    } else {
        Err(TableError::InvalidResponse(format!(
            "{} sheet is missing its header row",
            table.title()
        )))
    }
}

/// Update a key in metadata rows in place, appending when absent. Every
/// write restamps the row's `UpdatedAt` cell.
fn upsert_metadata_row(rows: &mut Vec<Vec<String>>, key: &str, value: &str, now_ms: i64) {
    let replacement = vec![key.to_string(), value.to_string(), now_ms.to_string()];
    for row in rows.iter_mut() {
        if cell(row, 0) == key {
            *row = replacement;
            return;
        }
    }
    rows.push(replacement);
}

// ---------------------------------------------------------------------------

/// HTTP client for the spreadsheet API.
#[derive(Clone)]
pub struct SheetsClient {
    client: Client,
    api_base: String,
    drive_base: String,
    token: Arc<dyn TokenSource>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl SheetsClient {
    pub fn new(token: Arc<dyn TokenSource>) -> TableResult<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            api_base: SHEETS_API_BASE.to_string(),
            drive_base: DRIVE_API_BASE.to_string(),
            token,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Point the client at different hosts. Test seam.
    #[must_use]
    pub fn with_base_urls(mut self, api_base: impl Into<String>, drive_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.drive_base = drive_base.into();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = retry;
        self.sleeper = sleeper;
        self
    }

    /// Find a spreadsheet by display name, or create one with the four
    /// tables and their header rows. Two clients racing this call can both
    /// create a spreadsheet; the search-before-create narrows but does not
    /// close that window.
    pub async fn get_or_create_remote(&self, display_name: &str) -> TableResult<RemoteIdentity> {
        let query = format!(
            "name = '{}' and mimeType = 'application/vnd.google-apps.spreadsheet' and trashed = false",
            display_name.replace('\'', "\\'")
        );
        let url = format!(
            "{}/drive/v3/files?q={}&fields=files(id,name)",
            self.drive_base,
            urlencode(&query)
        );
        let found = self.send(Method::GET, url, None).await?;

        if let Some(id) = found["files"][0]["id"].as_str() {
            tracing::debug!("Reusing existing spreadsheet {id}");
            return Ok(remote_identity(id));
        }

        let body = json!({
            "properties": { "title": display_name },
            "sheets": Table::ALL.map(|table| json!({
                "properties": { "title": table.title() }
            })),
        });
        let created = self
            .send(
                Method::POST,
                format!("{}/v4/spreadsheets", self.api_base),
                Some(body),
            )
            .await?;

        let id = created["spreadsheetId"].as_str().ok_or_else(|| {
            TableError::InvalidResponse("create response missing spreadsheetId".to_string())
        })?;
        tracing::info!("Created spreadsheet {id}");

        for table in Table::ALL {
            self.overwrite_all(id, table, Vec::new()).await?;
        }

        Ok(remote_identity(id))
    }

    /// Read every data row of a table, header validated and stripped.
    pub async fn read_all(&self, spreadsheet_id: &str, table: Table) -> TableResult<Vec<Vec<String>>> {
        let url = format!(
            "{}/v4/spreadsheets/{spreadsheet_id}/values/{}!A1:Z",
            self.api_base,
            table.title()
        );
        let payload = self.send(Method::GET, url, None).await?;

        let mut rows: Vec<Vec<String>> = payload["values"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| {
                                cells
                                    .iter()
                                    .map(|cell| cell.as_str().unwrap_or_default().to_string())
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();

        validate_headers(table, rows.first().map(Vec::as_slice))?;
        rows.remove(0);
        Ok(rows)
    }

    /// Clear the table and write headers plus `rows`. Replaying the same
    /// call yields the same remote state, which is what makes at-least-once
    /// delivery safe.
    pub async fn overwrite_all(
        &self,
        spreadsheet_id: &str,
        table: Table,
        rows: Vec<Vec<String>>,
    ) -> TableResult<()> {
        let clear_url = format!(
            "{}/v4/spreadsheets/{spreadsheet_id}/values/{}!A1:Z:clear",
            self.api_base,
            table.title()
        );
        self.send(Method::POST, clear_url, Some(json!({}))).await?;

        let mut values: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
        values.push(table.headers().iter().map(|s| (*s).to_string()).collect());
        values.extend(rows);

        let write_url = format!(
            "{}/v4/spreadsheets/{spreadsheet_id}/values/{}!A1?valueInputOption=RAW",
            self.api_base,
            table.title()
        );
        self.send(Method::PUT, write_url, Some(json!({ "values": values })))
            .await?;
        Ok(())
    }

    /// Append one data row without touching existing rows.
    pub async fn append_row(
        &self,
        spreadsheet_id: &str,
        table: Table,
        row: Vec<String>,
    ) -> TableResult<()> {
        let url = format!(
            "{}/v4/spreadsheets/{spreadsheet_id}/values/{}!A1:append?valueInputOption=RAW",
            self.api_base,
            table.title()
        );
        self.send(Method::POST, url, Some(json!({ "values": [row] })))
            .await?;
        Ok(())
    }

    pub async fn read_metadata(
        &self,
        spreadsheet_id: &str,
        key: &str,
    ) -> TableResult<Option<String>> {
        let rows = self.read_all(spreadsheet_id, Table::Metadata).await?;
        Ok(rows
            .iter()
            .find(|row| cell(row, 0) == key)
            .map(|row| cell(row, 1).to_string()))
    }

    pub async fn write_metadata(
        &self,
        spreadsheet_id: &str,
        key: &str,
        value: &str,
    ) -> TableResult<()> {
        let mut rows = self.read_all(spreadsheet_id, Table::Metadata).await?;
        upsert_metadata_row(&mut rows, key, value, unix_timestamp_ms());
        self.overwrite_all(spreadsheet_id, Table::Metadata, rows)
            .await
    }

    /// Authenticated request with the retry budget applied. All API calls
    /// funnel through here so status mapping lives in one place.
    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> TableResult<serde_json::Value> {
        self.retry
            .run(self.sleeper.as_ref(), || {
                let method = method.clone();
                let url = url.clone();
                let body = body.clone();
                async move { self.attempt(method, &url, body).await }
            })
            .await
    }

    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RetryDecision<TableError>> {
        let token = self
            .token
            .token()
            .await
            .map_err(|error| RetryDecision::Fatal(error.into()))?;
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| RetryDecision::Fatal(error.into()))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, url, retry_after, &body));
        }

        let text = response
            .text()
            .await
            .map_err(|error| RetryDecision::Fatal(error.into()))?;
        if text.trim().is_empty() {
            Ok(serde_json::Value::Null)
        } else {
            serde_json::from_str(&text).map_err(|error| {
                RetryDecision::Fatal(TableError::InvalidResponse(format!(
                    "malformed JSON body: {error}"
                )))
            })
        }
    }
}

/// Map a non-2xx status to a typed error and a retry decision.
fn classify_status(
    status: StatusCode,
    url: &str,
    retry_after: Option<std::time::Duration>,
    body: &str,
) -> RetryDecision<TableError> {
    match status {
        StatusCode::NOT_FOUND => RetryDecision::Fatal(TableError::NotFound(url.to_string())),
        StatusCode::FORBIDDEN => RetryDecision::Fatal(TableError::PermissionDenied),
        StatusCode::CONFLICT => {
            RetryDecision::Fatal(TableError::Conflict(parse_api_error(status, body)))
        }
        StatusCode::TOO_MANY_REQUESTS => RetryDecision::Retry {
            after: retry_after,
            error: TableError::RateLimited,
        },
        _ => RetryDecision::Fatal(TableError::InvalidResponse(parse_api_error(status, body))),
    }
}

#[async_trait::async_trait]
impl crate::engine::TableStore for SheetsClient {
    async fn get_or_create_remote(&self, display_name: &str) -> TableResult<RemoteIdentity> {
        Self::get_or_create_remote(self, display_name).await
    }

    async fn read_table(&self, spreadsheet_id: &str, table: Table) -> TableResult<Vec<Vec<String>>> {
        self.read_all(spreadsheet_id, table).await
    }

    async fn overwrite_table(
        &self,
        spreadsheet_id: &str,
        table: Table,
        rows: Vec<Vec<String>>,
    ) -> TableResult<()> {
        self.overwrite_all(spreadsheet_id, table, rows).await
    }

    async fn read_metadata(&self, spreadsheet_id: &str, key: &str) -> TableResult<Option<String>> {
        Self::read_metadata(self, spreadsheet_id, key).await
    }

    async fn write_metadata(&self, spreadsheet_id: &str, key: &str, value: &str) -> TableResult<()> {
        Self::write_metadata(self, spreadsheet_id, key, value).await
    }
}

fn remote_identity(spreadsheet_id: &str) -> RemoteIdentity {
    RemoteIdentity {
        spreadsheet_id: spreadsheet_id.to_string(),
        url: format!("{SPREADSHEET_URL_BASE}/{spreadsheet_id}"),
    }
}

/// Percent-encode a query string value.
pub(crate) fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
