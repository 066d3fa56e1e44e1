//! Error types for the realtime sync layer.
//!
//! Everything that can fail inside a channel, coordinator or consumer is
//! expressed as a [`RealtimeError`]. Errors are caught at the coordinator
//! boundary and logged; they are never rethrown into UI callbacks.

use thiserror::Error;

/// Result type for realtime operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors that can occur in the realtime layer
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Transport-level failure (socket closed, join rejected, send failed)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Operation did not complete within its timeout
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// No live channel to send through
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Session is absent or expired (HTTP 401). Treated as a benign state.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Non-success HTTP status other than 401
    #[error("Server error ({status_code}): {message}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Network failure reaching an HTTP collaborator
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Failed to encode or decode JSON
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Wire payload could not be narrowed into a typed event
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The channel or coordinator was already torn down
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Operation cancelled by teardown
    #[error("Operation cancelled")]
    Cancelled,
}

impl RealtimeError {
    /// Whether a retry may succeed.
    ///
    /// Authentication absence and malformed input are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportError(_)
            | Self::TimeoutError(_)
            | Self::NotConnected(_)
            | Self::NetworkError(_) => true,
            Self::ServerError { .. } => true,
            Self::ConfigurationError(_)
            | Self::Unauthenticated
            | Self::SerializationError(_)
            | Self::MalformedPayload(_)
            | Self::ChannelClosed(_)
            | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for RealtimeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimeoutError(err.to_string())
        } else if let Some(status) = err.status() {
            if status.as_u16() == 401 {
                Self::Unauthenticated
            } else {
                Self::ServerError {
                    status_code: status.as_u16(),
                    message: err.to_string(),
                }
            }
        } else if err.is_decode() {
            Self::SerializationError(err.to_string())
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for RealtimeError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigurationError(format!("TOML parse error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransportError(err.to_string())
    }
}
