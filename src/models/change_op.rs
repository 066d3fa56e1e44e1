use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of row mutation carried by a change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// Row inserted
    #[serde(alias = "insert")]
    Insert,

    /// Row updated
    #[serde(alias = "update")]
    Update,

    /// Row deleted
    #[serde(alias = "delete")]
    Delete,
}

impl ChangeOp {
    /// Wire name used in change-feed filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
