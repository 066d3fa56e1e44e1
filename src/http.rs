//! HTTP collaborators: presence touches and quiet-hours queries.
//!
//! Consumers depend on the [`PresenceApi`] and [`QuietHoursApi`] traits;
//! [`HttpApiClient`] is the reqwest implementation. Requests carry the
//! session cookie jar ("credentials included") and, when configured, a
//! bearer token or API key.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

use crate::auth::{CredentialSource, Credentials};
use crate::error::{RealtimeError, Result};
use crate::models::{QuietHoursSettings, QuietHoursStatus};

pub const PRESENCE_UPDATE_PATH: &str = "/presence/update";
pub const QUIET_HOURS_PATH: &str = "/quiet-hours";
pub const QUIET_HOURS_STATUS_PATH: &str = "/quiet-hours/status";

/// Presence endpoint: records "last seen active" for a user.
#[async_trait]
pub trait PresenceApi: Send + Sync + 'static {
    /// `Err(Unauthenticated)` when the session is missing or expired.
    async fn touch(&self, user_id: &str) -> Result<()>;
}

/// Quiet-hours endpoints.
#[async_trait]
pub trait QuietHoursApi: Send + Sync + 'static {
    async fn fetch_settings(&self) -> Result<QuietHoursSettings>;

    /// Server-computed verdict for the current instant.
    async fn is_quiet_now(&self) -> Result<bool>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceTouch<'a> {
    user_id: &'a str,
}

/// reqwest-backed implementation of the HTTP collaborators.
#[derive(Clone)]
pub struct HttpApiClient {
    base_url: String,
    http_client: reqwest::Client,
    credentials: CredentialSource,
}

impl fmt::Debug for HttpApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpApiClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl HttpApiClient {
    pub fn builder() -> HttpApiClientBuilder {
        HttpApiClientBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let credentials = self.credentials.resolve().await?;
        Ok(credentials.apply_to_request(request))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let request = self.authorize(self.http_client.get(&url)).await?;

        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        log::debug!(
            "[realtime-sync] GET {} -> {} in {:?}",
            path,
            status,
            start.elapsed()
        );
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        Ok(response.json::<T>().await?)
    }
}

/// 401 → `Unauthenticated`; anything else that is not 2xx → `ServerError`.
pub fn classify_status(status: StatusCode, body: String) -> RealtimeError {
    if status == StatusCode::UNAUTHORIZED {
        return RealtimeError::Unauthenticated;
    }
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body
    };
    RealtimeError::ServerError {
        status_code: status.as_u16(),
        message,
    }
}

#[async_trait]
impl PresenceApi for HttpApiClient {
    async fn touch(&self, user_id: &str) -> Result<()> {
        let url = self.url(PRESENCE_UPDATE_PATH);
        let request = self
            .authorize(self.http_client.post(&url).json(&PresenceTouch { user_id }))
            .await?;

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            log::debug!("[realtime-sync] presence touched for {}", user_id);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

#[async_trait]
impl QuietHoursApi for HttpApiClient {
    async fn fetch_settings(&self) -> Result<QuietHoursSettings> {
        self.get_json(QUIET_HOURS_PATH).await
    }

    async fn is_quiet_now(&self) -> Result<bool> {
        let status: QuietHoursStatus = self.get_json(QUIET_HOURS_STATUS_PATH).await?;
        Ok(status.is_quiet)
    }
}

/// Builder for [`HttpApiClient`].
#[derive(Debug)]
pub struct HttpApiClientBuilder {
    base_url: Option<String>,
    timeout: Duration,
    credentials: CredentialSource,
}

impl Default for HttpApiClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpApiClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(10),
            credentials: CredentialSource::default(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = CredentialSource::Static(credentials);
        self
    }

    pub fn credential_source(mut self, source: CredentialSource) -> Self {
        self.credentials = source;
        self
    }

    pub fn build(self) -> Result<HttpApiClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| RealtimeError::ConfigurationError("http.base_url is required".into()))?;
        let parsed = reqwest::Url::parse(&base_url).map_err(|e| {
            RealtimeError::ConfigurationError(format!("Invalid http.base_url '{}': {}", base_url, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RealtimeError::ConfigurationError(format!(
                "http.base_url must use http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let http_client = reqwest::Client::builder()
            .timeout(self.timeout)
            .cookie_store(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| RealtimeError::ConfigurationError(e.to_string()))?;

        Ok(HttpApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            credentials: self.credentials,
        })
    }
}
