//! Timeout and interval configuration for the realtime layer.
//!
//! Centralizes every timer the layer arms: transport connect/join deadlines,
//! keepalive, typing TTL and sweep, presence heartbeat and the inactivity
//! watchdog.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout and interval configuration for realtime operations.
///
/// # Examples
///
/// ```rust
/// use realtime_sync::RealtimeTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = RealtimeTimeouts::default();
///
/// // Shorter heartbeat for a kiosk deployment
/// let timeouts = RealtimeTimeouts::builder()
///     .heartbeat_interval(Duration::from_secs(10))
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeTimeouts {
    /// Timeout for establishing the shared transport connection.
    /// Default: 10 seconds
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,

    /// Time the transport waits for a join reply before reporting `timed_out`.
    /// Default: 10 seconds
    #[serde(with = "duration_ms")]
    pub join_timeout: Duration,

    /// Transport keepalive heartbeat interval. Set to 0 to disable.
    /// Default: 25 seconds
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,

    /// Maximum wait for a keepalive reply before the socket is considered dead.
    /// Set to 0 to disable.
    /// Default: 10 seconds
    #[serde(with = "duration_ms")]
    pub pong_timeout: Duration,

    /// Timeout for HTTP collaborator calls (presence, quiet hours).
    /// Default: 10 seconds
    #[serde(with = "duration_ms")]
    pub http_timeout: Duration,

    /// How long a typing participant stays visible after its last signal.
    /// Default: 3 seconds
    #[serde(with = "duration_ms")]
    pub typing_ttl: Duration,

    /// Period of the typing roster sweep.
    /// Default: 1 second
    #[serde(with = "duration_ms")]
    pub typing_sweep_interval: Duration,

    /// Idle time after the last keystroke before an automatic typing `stop`.
    /// Default: 3 seconds
    #[serde(with = "duration_ms")]
    pub typing_idle_stop: Duration,

    /// Presence touch interval while active.
    /// Default: 30 seconds
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Input inactivity after which presence publishing pauses.
    /// Default: 5 minutes
    #[serde(with = "duration_ms")]
    pub inactivity_timeout: Duration,
}

impl Default for RealtimeTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
            typing_ttl: Duration::from_secs(3),
            typing_sweep_interval: Duration::from_secs(1),
            typing_idle_stop: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl RealtimeTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> RealtimeTimeoutsBuilder {
        RealtimeTimeoutsBuilder::new()
    }

    /// Timeouts for a local development server.
    ///
    /// Transport deadlines are shortened; UI-facing intervals keep their
    /// production values so behavior stays recognizable.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(3),
            http_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Timeouts for integration tests driving a loopback server.
    pub fn for_testing() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::ZERO,
            pong_timeout: Duration::ZERO,
            http_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for creating custom [`RealtimeTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct RealtimeTimeoutsBuilder {
    timeouts: RealtimeTimeouts,
}

impl RealtimeTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: RealtimeTimeouts::default(),
        }
    }

    /// Set the transport connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the join reply timeout.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.join_timeout = timeout;
        self
    }

    /// Set the keepalive heartbeat interval. 0 disables it.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the keepalive reply timeout. 0 disables it.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Set the HTTP request timeout.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.http_timeout = timeout;
        self
    }

    /// Set the typing participant TTL.
    pub fn typing_ttl(mut self, ttl: Duration) -> Self {
        self.timeouts.typing_ttl = ttl;
        self
    }

    /// Set the typing sweep period.
    pub fn typing_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeouts.typing_sweep_interval = interval;
        self
    }

    /// Set the idle time before an automatic typing `stop`.
    pub fn typing_idle_stop(mut self, idle: Duration) -> Self {
        self.timeouts.typing_idle_stop = idle;
        self
    }

    /// Set the presence heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.timeouts.heartbeat_interval = interval;
        self
    }

    /// Set the presence inactivity timeout.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.inactivity_timeout = timeout;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> RealtimeTimeouts {
        self.timeouts
    }
}

/// Serialize `Duration` fields as integer milliseconds in config files.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
