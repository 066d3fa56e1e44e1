//! Typed row shapes delivered by the change-feed consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row with a stable id, optionally carrying a monotonic version.
///
/// Used by [`LiveRows`](crate::consumers::LiveRows) for upsert-by-id.
pub trait LiveRow {
    /// Primary key
    fn row_id(&self) -> &str;

    /// Monotonic version (e.g. `updated_at` in millis). `None` disables
    /// out-of-order rejection for this row.
    fn row_version(&self) -> Option<i64> {
        None
    }
}

/// In-app notification row (`notifications` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl LiveRow for NotificationRow {
    fn row_id(&self) -> &str {
        &self.id
    }

    fn row_version(&self) -> Option<i64> {
        self.created_at.map(|ts| ts.timestamp_millis())
    }
}

/// Project row (`projects` table). Only the fields the dashboard reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LiveRow for ProjectRow {
    fn row_id(&self) -> &str {
        &self.id
    }

    fn row_version(&self) -> Option<i64> {
        self.updated_at.map(|ts| ts.timestamp_millis())
    }
}
