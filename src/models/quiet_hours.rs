use serde::{Deserialize, Serialize};

/// Persisted quiet-hours settings as returned by the settings endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHoursSettings {
    pub enabled: bool,
    /// `"HH:MM"`
    pub start_time: String,
    /// `"HH:MM"`, may be earlier than `start_time` (wraps past midnight)
    pub end_time: String,
    /// Day names, e.g. `["monday", "tuesday"]` or `["Mon", "Tue"]`
    #[serde(default)]
    pub days: Vec<String>,
}

/// Server-computed verdict for "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHoursStatus {
    pub is_quiet: bool,
}
