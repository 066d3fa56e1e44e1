use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single [`ChannelHandle`](crate::channel::ChannelHandle).
///
/// A normal lifecycle reports `Subscribing → Active → Closed`, with any
/// number of `Erroring → Subscribing → Active` loops in between (each loop
/// on a fresh handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Created, not yet joined
    Idle,
    /// Join sent, waiting for the transport's verdict
    Subscribing,
    /// Transport confirmed the join
    Active,
    /// Transport reported an error, timeout or unexpected close
    Erroring,
    /// Torn down by its owner; terminal
    Closed,
}

impl ChannelState {
    /// `Subscribing` or `Active`: a second `open` for the same key reuses it.
    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Subscribing | ChannelState::Active)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Subscribing => "subscribing",
            ChannelState::Active => "active",
            ChannelState::Erroring => "erroring",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}
