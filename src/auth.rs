//! Credentials attached to HTTP collaborator calls and the WebSocket handshake.
//!
//! Session cookies are carried by the reqwest cookie store; these credentials
//! cover the cases where the host also holds a bearer token or a project API
//! key.
//!
//! ```rust,no_run
//! use realtime_sync::{Credentials, DynamicCredentials};
//! use std::sync::Arc;
//!
//! struct SessionStore;
//!
//! #[async_trait::async_trait]
//! impl DynamicCredentials for SessionStore {
//!     async fn current(&self) -> realtime_sync::Result<Credentials> {
//!         Ok(Credentials::bearer("fresh-token"))
//!     }
//! }
//!
//! // .credentials(Arc::new(SessionStore))
//! ```

use std::sync::Arc;

use crate::error::Result;

/// Header carrying the project API key on HTTP and WebSocket requests.
pub const API_KEY_HEADER: &str = "apikey";

/// Static credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `Authorization: Bearer <token>`
    Bearer(String),

    /// `apikey: <key>` header (and `apikey` query parameter on WebSocket URLs)
    ApiKey(String),

    /// Cookies only
    None,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(key.into())
    }

    pub fn none() -> Self {
        Self::None
    }

    /// Attach the credential header to an HTTP request builder.
    pub fn apply_to_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Bearer(token) => request.bearer_auth(token),
            Self::ApiKey(key) => request.header(API_KEY_HEADER, key),
            Self::None => request,
        }
    }

    /// Query parameter appended to the WebSocket URL, if any.
    pub fn ws_query_param(&self) -> Option<(&'static str, &str)> {
        match self {
            Self::ApiKey(key) => Some((API_KEY_HEADER, key.as_str())),
            Self::Bearer(_) | Self::None => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => write!(f, "Credentials::Bearer(<redacted>)"),
            Self::ApiKey(_) => write!(f, "Credentials::ApiKey(<redacted>)"),
            Self::None => write!(f, "Credentials::None"),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::None
    }
}

// ── Dynamic credentials ─────────────────────────────────────────────────────

/// Async credential source consulted before every HTTP call.
///
/// Implement this when tokens rotate with the host's session.
#[async_trait::async_trait]
pub trait DynamicCredentials: Send + Sync + 'static {
    async fn current(&self) -> Result<Credentials>;
}

/// Static or dynamic credentials.
#[derive(Clone)]
pub enum CredentialSource {
    Static(Credentials),
    Dynamic(Arc<dyn DynamicCredentials>),
}

impl CredentialSource {
    /// Obtain effective credentials, calling the dynamic source if present.
    pub async fn resolve(&self) -> Result<Credentials> {
        match self {
            Self::Static(c) => Ok(c.clone()),
            Self::Dynamic(source) => source.current().await,
        }
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(c) => write!(f, "CredentialSource::Static({:?})", c),
            Self::Dynamic(_) => write!(f, "CredentialSource::Dynamic(<fn>)"),
        }
    }
}

impl Default for CredentialSource {
    fn default() -> Self {
        Self::Static(Credentials::None)
    }
}

impl From<Credentials> for CredentialSource {
    fn from(c: Credentials) -> Self {
        Self::Static(c)
    }
}

impl From<Arc<dyn DynamicCredentials>> for CredentialSource {
    fn from(source: Arc<dyn DynamicCredentials>) -> Self {
        Self::Dynamic(source)
    }
}
