//! TOML configuration for hosts embedding the realtime layer.
//!
//! ```toml
//! [transport]
//! url = "wss://project.example.com/realtime/v1"
//! api_key = "anon-key"
//!
//! [http]
//! base_url = "https://app.example.com/api"
//!
//! [reconnect.change_feed]
//! max_attempts = 10
//!
//! [timeouts]
//! heartbeat_interval = 30000
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```
//!
//! Load with [`RealtimeConfig::from_file`], then call
//! [`apply_env_overrides`](RealtimeConfig::apply_env_overrides) and
//! [`finalize`](RealtimeConfig::finalize).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::auth::Credentials;
use crate::reconnect::ReconnectPolicies;
use crate::timeouts::RealtimeTimeouts;

pub const ENV_URL: &str = "REALTIME_URL";
pub const ENV_API_KEY: &str = "REALTIME_API_KEY";
pub const ENV_HTTP_BASE_URL: &str = "REALTIME_HTTP_BASE_URL";
pub const ENV_LOG_LEVEL: &str = "REALTIME_LOG_LEVEL";

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
const VALID_FORMATS: [&str; 3] = ["compact", "pretty", "json"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub reconnect: ReconnectPolicies,
    #[serde(default)]
    pub timeouts: RealtimeTimeouts,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Shared WebSocket transport.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// `ws://`, `wss://`, `http://` or `https://` endpoint of the realtime server
    #[serde(default = "default_transport_url")]
    pub url: String,
    /// Sent as the `apikey` query parameter
    #[serde(default)]
    pub api_key: Option<String>,
    /// User token sent with every join; takes precedence over `api_key` for
    /// the upgrade request
    #[serde(default)]
    pub access_token: Option<String>,
    /// Disable the transport keepalive heartbeat
    #[serde(default)]
    pub disable_heartbeat: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: default_transport_url(),
            api_key: None,
            access_token: None,
            disable_heartbeat: false,
        }
    }
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("disable_heartbeat", &self.disable_heartbeat)
            .finish()
    }
}

impl TransportSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Credentials for the socket upgrade request.
    pub fn credentials(&self) -> Credentials {
        match (&self.access_token, &self.api_key) {
            (Some(token), _) => Credentials::bearer(token.clone()),
            (None, Some(key)) => Credentials::api_key(key.clone()),
            (None, None) => Credentials::None,
        }
    }
}

/// HTTP collaborators (presence, quiet hours). Disabled when `base_url` is unset.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl fmt::Debug for HttpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSettings")
            .field("base_url", &self.base_url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl HttpSettings {
    pub fn credentials(&self) -> Credentials {
        self.bearer_token
            .as_ref()
            .map(|token| Credentials::bearer(token.clone()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Per-target level overrides, e.g. `tokio_tungstenite = "warn"`
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            targets: HashMap::new(),
        }
    }
}

fn default_transport_url() -> String {
    "ws://localhost:4000/socket".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl RealtimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment overrides are applied separately via `apply_env_overrides()`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))
    }

    /// Apply `REALTIME_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (environment, CLI, tests).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_URL) {
            self.transport.url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.transport.api_key = Some(key);
        }
        if let Some(base_url) = lookup(ENV_HTTP_BASE_URL) {
            self.http.base_url = Some(base_url);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.to_lowercase();
        }
    }

    /// Fold derived settings into place and validate.
    ///
    /// Call this after applying environment overrides.
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        if self.transport.disable_heartbeat {
            self.timeouts.keepalive_interval = Duration::ZERO;
        }
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.transport.url)
            .map_err(|e| anyhow::anyhow!("Invalid transport.url '{}': {}", self.transport.url, e))?;
        if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(anyhow::anyhow!(
                "transport.url must use ws, wss, http or https, got '{}'",
                url.scheme()
            ));
        }

        if let Some(base_url) = &self.http.base_url {
            let parsed = reqwest::Url::parse(base_url)
                .map_err(|e| anyhow::anyhow!("Invalid http.base_url '{}': {}", base_url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow::anyhow!(
                    "http.base_url must use http or https, got '{}'",
                    parsed.scheme()
                ));
            }
        }

        self.reconnect.validate()?;

        if self.timeouts.typing_ttl.is_zero() {
            return Err(anyhow::anyhow!("timeouts.typing_ttl cannot be 0"));
        }
        if self.timeouts.typing_sweep_interval.is_zero() {
            return Err(anyhow::anyhow!("timeouts.typing_sweep_interval cannot be 0"));
        }
        if self.timeouts.heartbeat_interval.is_zero() {
            return Err(anyhow::anyhow!("timeouts.heartbeat_interval cannot be 0"));
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            ));
        }
        if !VALID_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            ));
        }
        for (target, level) in &self.logging.targets {
            if !VALID_LEVELS.contains(&level.as_str()) {
                return Err(anyhow::anyhow!(
                    "Invalid log level '{}' for target '{}'. Must be one of: {}",
                    level,
                    target,
                    VALID_LEVELS.join(", ")
                ));
            }
        }

        Ok(())
    }
}
