use serde::{Deserialize, Serialize};

use super::change_op::ChangeOp;
use super::event::{Event, EventKind};

/// One event filter attached to a channel.
///
/// # Example
///
/// ```rust
/// use realtime_sync::{ChangeOp, FilterSpec};
///
/// let mine = FilterSpec::rows("notifications")
///     .with_op(ChangeOp::Insert)
///     .with_filter("user_id=eq.42");
/// let typing = FilterSpec::broadcast("typing_start");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Row-level mutations of one table, optionally narrowed by operation
    /// and a server-side filter expression (`column=eq.value`).
    RowChange {
        schema: String,
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<ChangeOp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },

    /// Ephemeral broadcast messages with the given event name.
    Broadcast { event: String },
}

impl FilterSpec {
    /// All mutations of `table` in the `public` schema.
    pub fn rows(table: impl Into<String>) -> Self {
        Self::RowChange {
            schema: "public".to_string(),
            table: table.into(),
            op: None,
            filter: None,
        }
    }

    /// Broadcast messages named `event`.
    pub fn broadcast(event: impl Into<String>) -> Self {
        Self::Broadcast {
            event: event.into(),
        }
    }

    /// Narrow a row filter to one operation. No-op for broadcast filters.
    pub fn with_op(mut self, change_op: ChangeOp) -> Self {
        if let Self::RowChange { op, .. } = &mut self {
            *op = Some(change_op);
        }
        self
    }

    /// Attach a server-side filter expression. No-op for broadcast filters.
    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        if let Self::RowChange { filter, .. } = &mut self {
            *filter = Some(expression.into());
        }
        self
    }

    /// Override the schema. No-op for broadcast filters.
    pub fn with_schema(mut self, name: impl Into<String>) -> Self {
        if let Self::RowChange { schema, .. } = &mut self {
            *schema = name.into();
        }
        self
    }
}

/// Everything a transport needs to join one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel topic, unique per logical channel
    pub topic: String,
    /// Event filters
    pub filters: Vec<FilterSpec>,
    /// Whether the sender receives its own broadcasts. Always false for
    /// channels opened by the consumers in this crate.
    #[serde(default)]
    pub receive_own_broadcasts: bool,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>, filters: Vec<FilterSpec>) -> Self {
        Self {
            topic: topic.into(),
            filters,
            receive_own_broadcasts: false,
        }
    }

    /// True if any filter is a broadcast filter.
    pub fn has_broadcast(&self) -> bool {
        self.filters
            .iter()
            .any(|f| matches!(f, FilterSpec::Broadcast { .. }))
    }

    /// Whether a decoded event matches one of this channel's filters.
    ///
    /// Row filters are matched by table and operation only; the server
    /// evaluates the filter expression.
    pub fn accepts(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| match (filter, event) {
            (
                FilterSpec::RowChange {
                    table: wanted, op, ..
                },
                Event::RowChanged {
                    table, op: got, ..
                },
            ) => wanted == table && op.map_or(true, |op| op == *got),
            (FilterSpec::Broadcast { event: name }, other) => {
                other.kind() != EventKind::RowChanged && *name == other.kind().to_string()
            },
            (FilterSpec::RowChange { .. }, _) => false,
        })
    }
}
