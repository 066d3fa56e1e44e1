use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lifecycle_state::LifecycleState;

/// Connection status exposed to UI code.
///
/// Written only by the owning coordinator; consumers get read-only copies
/// through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Coordinator state at the time of the snapshot
    pub state: LifecycleState,

    /// True while the channel is `Active`
    pub connected: bool,

    /// Last transition to `Active`
    pub last_connected_at: Option<DateTime<Utc>>,

    /// Retries scheduled since the last `Active`
    pub reconnect_attempts: u32,

    /// Last failure cause, cleared on success
    pub error: Option<String>,

    /// Retries exhausted; realtime is off until a wake signal
    pub degraded: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            connected: false,
            last_connected_at: None,
            reconnect_attempts: 0,
            error: None,
            degraded: false,
        }
    }
}
