use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a [`LifecycleCoordinator`](crate::coordinator::LifecycleCoordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No channel: waiting for an identity, or torn down while hidden
    Idle,
    /// A channel is joining
    Subscribing,
    /// The channel is live
    Active,
    /// The channel failed; a retry may be pending
    Erroring,
    /// Retries exhausted; waits for a wake signal
    Degraded,
    /// Unmounted; terminal
    Closed,
}

impl LifecycleState {
    /// `Closed` is the only state that ignores every signal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Subscribing => "subscribing",
            LifecycleState::Active => "active",
            LifecycleState::Erroring => "erroring",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}
