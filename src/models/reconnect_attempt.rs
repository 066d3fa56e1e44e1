use serde::{Deserialize, Serialize};

/// A scheduled retry, reported through `on_reconnect_scheduled`.
///
/// Reset to zero on every transition to `Active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectAttempt {
    /// Retries scheduled so far, including this one
    pub count: u32,
    /// What made the previous channel fail
    pub last_cause: Option<String>,
    /// Delay before this retry runs
    pub next_delay_ms: u64,
}
