use serde::{Deserialize, Serialize};

use super::channel_state::ChannelState;

/// Snapshot of a registered channel, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Owning consumer instance
    pub consumer: u64,
    /// Logical channel name
    pub name: String,
    /// Generation tag of the live handle
    pub generation: u64,
    /// Current handle state
    pub state: ChannelState,
    /// When the handle was opened (millis since epoch)
    pub opened_at_ms: u64,
    /// When the last event was delivered (millis since epoch)
    pub last_event_at_ms: Option<u64>,
}
