//! OAuth 2.0 token management with PKCE.
//!
//! The manager owns the authorization-code flow, token caching, refresh,
//! and revocation. Persistence goes through [`CredentialStore`] so desktop
//! and test builds can store secrets differently.

pub mod pkce;

use std::fmt;
use std::sync::{Arc, Mutex};

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use packrat_core::db::{keys, Database, SettingsRepository, SqliteSettingsRepository};

use crate::error::{AuthError, AuthResult};

/// Refresh this long before the recorded expiry (ms).
const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;

/// Stored OAuth credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token expiry (Unix ms).
    pub expires_at: i64,
}

impl Credentials {
    /// Whether the access token is still usable at `now_ms`, keeping a
    /// safety margin before the recorded expiry.
    #[must_use]
    pub const fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at - REFRESH_MARGIN_MS
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Short-lived state of an authorization flow awaiting its callback code.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFlowState {
    pub verifier: String,
    pub redirect_uri: String,
}

impl fmt::Debug for AuthFlowState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthFlowState")
            .field("verifier", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Persistence seam for credentials and in-flight flow state.
pub trait CredentialStore: Send + Sync + 'static {
    fn load_credentials(&self) -> AuthResult<Option<Credentials>>;
    fn save_credentials(&self, credentials: &Credentials) -> AuthResult<()>;
    fn clear_credentials(&self) -> AuthResult<()>;

    fn load_flow_state(&self) -> AuthResult<Option<AuthFlowState>>;
    fn save_flow_state(&self, state: &AuthFlowState) -> AuthResult<()>;
    fn clear_flow_state(&self) -> AuthResult<()>;
}

/// Anything that can hand out a bearer token on demand. Adapters depend on
/// this instead of a concrete manager so tests can inject a constant.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> AuthResult<String>;
}

/// OAuth provider endpoints and client registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub client_id: String,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub redirect_uri: String,
    /// Space-separated scope set requested at authorization.
    pub scopes: String,
}

impl AuthConfig {
    /// Google endpoints with spreadsheet-write and app-created-files scopes.
    pub fn google(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            redirect_uri: redirect_uri.into(),
            scopes: "https://www.googleapis.com/auth/spreadsheets \
                     https://www.googleapis.com/auth/drive.file"
                .to_string(),
        }
    }

    fn validate(&self) -> AuthResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig("client_id must not be empty"));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(AuthError::InvalidConfig("redirect_uri must not be empty"));
        }
        Ok(())
    }
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// OAuth token manager.
#[derive(Clone)]
pub struct TokenManager<S: CredentialStore> {
    config: AuthConfig,
    client: Client,
    store: Arc<S>,
    clock: Clock,
}

impl<S: CredentialStore> TokenManager<S> {
    pub fn new(config: AuthConfig, store: S) -> AuthResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client: Client::builder().build()?,
            store: Arc::new(store),
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    /// Replace the wall clock. Test seam for the refresh boundary.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Whether credentials are currently persisted.
    pub fn is_signed_in(&self) -> AuthResult<bool> {
        Ok(self.store.load_credentials()?.is_some())
    }

    /// Start an authorization flow: persist the PKCE state and return the
    /// URL the user must visit.
    pub fn begin_auth(&self) -> AuthResult<String> {
        let verifier = pkce::code_verifier();
        let challenge = pkce::code_challenge(&verifier);

        self.store.save_flow_state(&AuthFlowState {
            verifier,
            redirect_uri: self.config.redirect_uri.clone(),
        })?;

        let url = Url::parse_with_params(
            &self.config.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", self.config.scopes.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|error| AuthError::AuthFailed(format!("invalid auth URL: {error}")))?;

        Ok(url.into())
    }

    /// Exchange the callback code for tokens using the stored verifier.
    pub async fn complete_auth(&self, code: &str) -> AuthResult<Credentials> {
        let flow = self
            .store
            .load_flow_state()?
            .ok_or_else(|| AuthError::AuthFailed("no authorization flow in progress".to_string()))?;

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("code", code),
                ("code_verifier", flow.verifier.as_str()),
                ("redirect_uri", flow.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::AuthFailed(parse_api_error(status, &body)));
        }

        let payload = response.json::<TokenResponse>().await?;
        let credentials = payload.into_credentials((self.clock)(), None)?;

        self.store.save_credentials(&credentials)?;
        self.store.clear_flow_state()?;
        Ok(credentials)
    }

    /// Return a usable access token, refreshing when inside the expiry
    /// margin. `TokenExpired` means sign-in is required.
    pub async fn valid_token(&self) -> AuthResult<String> {
        let credentials = self
            .store
            .load_credentials()?
            .ok_or(AuthError::TokenExpired)?;

        if credentials.is_fresh((self.clock)()) {
            return Ok(credentials.access_token);
        }

        let refreshed = self.refresh(&credentials).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh the access token. On any failure the stored credentials are
    /// cleared so the caller sees a clean signed-out state.
    pub async fn refresh(&self, credentials: &Credentials) -> AuthResult<Credentials> {
        let Some(refresh_token) = credentials.refresh_token.as_deref() else {
            self.store.clear_credentials()?;
            return Err(AuthError::TokenRefreshFailed(
                "no refresh token was granted".to_string(),
            ));
        };

        let result = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                self.store.clear_credentials()?;
                return Err(AuthError::TokenRefreshFailed(error.to_string()));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            self.store.clear_credentials()?;
            return Err(AuthError::TokenRefreshFailed(parse_api_error(status, &body)));
        }

        let payload = response.json::<TokenResponse>().await?;
        // Providers may omit the refresh token on refresh; keep the old one.
        let refreshed =
            payload.into_credentials((self.clock)(), credentials.refresh_token.clone())?;

        self.store.save_credentials(&refreshed)?;
        Ok(refreshed)
    }

    /// Revoke the remote grant best-effort, then clear local state.
    pub async fn revoke(&self) -> AuthResult<()> {
        if let Some(credentials) = self.store.load_credentials()? {
            let token = credentials
                .refresh_token
                .unwrap_or(credentials.access_token);
            let result = self
                .client
                .post(&self.config.revoke_url)
                .form(&[("token", token.as_str())])
                .send()
                .await;

            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        "Remote token revocation returned {}",
                        response.status().as_u16()
                    );
                }
                Err(error) => tracing::warn!("Remote token revocation failed: {error}"),
                Ok(_) => {}
            }
        }

        self.store.clear_credentials()?;
        self.store.clear_flow_state()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: CredentialStore> TokenSource for TokenManager<S> {
    async fn token(&self) -> AuthResult<String> {
        self.valid_token().await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_credentials(
        self,
        now_ms: i64,
        fallback_refresh: Option<String>,
    ) -> AuthResult<Credentials> {
        let access_token = self.access_token.ok_or_else(|| {
            AuthError::AuthFailed("token response did not include an access token".to_string())
        })?;
        let expires_in = self.expires_in.unwrap_or(3600);
        Ok(Credentials {
            access_token,
            refresh_token: self.refresh_token.or(fallback_refresh),
            expires_at: now_ms.saturating_add(expires_in.saturating_mul(1000)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<OAuthErrorResponse>(body) {
        if let Some(message) = payload.error_description.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

/// Credential persistence over the settings table in the local database.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteCredentialStore {
    #[must_use]
    pub const fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn with_settings<T>(
        &self,
        f: impl FnOnce(&SqliteSettingsRepository<'_>) -> packrat_core::Result<T>,
    ) -> AuthResult<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| AuthError::Storage("credential store lock poisoned".to_string()))?;
        let settings = SqliteSettingsRepository::new(db.connection());
        f(&settings).map_err(|error| AuthError::Storage(error.to_string()))
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load_credentials(&self) -> AuthResult<Option<Credentials>> {
        let raw = self.with_settings(|settings| settings.get(keys::CREDENTIALS))?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    fn save_credentials(&self, credentials: &Credentials) -> AuthResult<()> {
        let raw = serde_json::to_string(credentials)?;
        self.with_settings(|settings| settings.set(keys::CREDENTIALS, &raw))
    }

    fn clear_credentials(&self) -> AuthResult<()> {
        self.with_settings(|settings| settings.delete(keys::CREDENTIALS))
    }

    fn load_flow_state(&self) -> AuthResult<Option<AuthFlowState>> {
        let raw = self.with_settings(|settings| settings.get(keys::AUTH_FLOW))?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    fn save_flow_state(&self, state: &AuthFlowState) -> AuthResult<()> {
        let raw = serde_json::to_string(state)?;
        self.with_settings(|settings| settings.set(keys::AUTH_FLOW, &raw))
    }

    fn clear_flow_state(&self) -> AuthResult<()> {
        self.with_settings(|settings| settings.delete(keys::AUTH_FLOW))
    }
}
