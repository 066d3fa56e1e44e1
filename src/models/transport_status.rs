use serde::{Deserialize, Serialize};
use std::fmt;

/// Status reported by a transport for one joined channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    /// Join acknowledged
    Subscribed,
    /// Join rejected or channel crashed server-side
    ChannelError,
    /// No join reply within the transport's own timeout
    TimedOut,
    /// Channel closed by the server or the socket went away
    Closed,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportStatus::Subscribed => "subscribed",
            TransportStatus::ChannelError => "channel_error",
            TransportStatus::TimedOut => "timed_out",
            TransportStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}
