//! Typed realtime events and their narrowing from wire payloads.
//!
//! Transports hand over `(event name, JSON payload)` pairs. [`Event::decode`]
//! narrows them into the closed [`Event`] set; anything else is a
//! [`RealtimeError::MalformedPayload`] that the channel logs and drops.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use super::change_op::ChangeOp;
use crate::error::{RealtimeError, Result};

/// Wire event name for row-level change pushes.
pub const ROW_CHANGE_EVENT: &str = "postgres_changes";

/// Wire event name for broadcast pushes.
pub const BROADCAST_EVENT: &str = "broadcast";

/// Broadcast event name: a participant started typing.
pub const TYPING_START: &str = "typing_start";

/// Broadcast event name: a participant stopped typing.
pub const TYPING_STOP: &str = "typing_stop";

/// Broadcast event name: presence heartbeat.
pub const HEARTBEAT: &str = "heartbeat";

/// Discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RowChanged,
    TypingStart,
    TypingStop,
    Heartbeat,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::RowChanged => "row_changed",
            EventKind::TypingStart => TYPING_START,
            EventKind::TypingStop => TYPING_STOP,
            EventKind::Heartbeat => HEARTBEAT,
        };
        f.write_str(name)
    }
}

/// Event delivered to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Row inserted, updated or deleted. For deletes `row` holds the old row.
    RowChanged {
        table: String,
        op: ChangeOp,
        row: Map<String, JsonValue>,
    },

    /// A participant started (or kept) typing.
    TypingStart {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },

    /// A participant stopped typing.
    TypingStop {
        conversation_id: String,
        user_id: String,
    },

    /// Presence heartbeat from a user.
    Heartbeat {
        user_id: String,
        /// Millis since epoch
        ts: i64,
    },
}

#[derive(Debug, Deserialize)]
struct RowChangeData {
    table: String,
    #[serde(rename = "type", alias = "eventType")]
    op: ChangeOp,
    #[serde(default)]
    record: Option<Map<String, JsonValue>>,
    #[serde(default, alias = "old")]
    old_record: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct BroadcastEnvelope {
    event: String,
    #[serde(default)]
    payload: JsonValue,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingStartPayload {
    conversation_id: String,
    user_id: String,
    user_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingStopPayload {
    conversation_id: String,
    user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload {
    user_id: String,
    ts: i64,
}

fn malformed(event: &str, detail: impl fmt::Display) -> RealtimeError {
    RealtimeError::MalformedPayload(format!("{}: {}", event, detail))
}

impl Event {
    /// Narrow a transport payload into a typed event.
    pub fn decode(event: &str, payload: &JsonValue) -> Result<Self> {
        match event {
            ROW_CHANGE_EVENT => Self::decode_row_change(payload),
            BROADCAST_EVENT => {
                let envelope: BroadcastEnvelope = serde_json::from_value(payload.clone())
                    .map_err(|e| malformed(event, e))?;
                Self::decode_broadcast(&envelope.event, envelope.payload)
            },
            other => Err(malformed(other, "unsupported event")),
        }
    }

    fn decode_row_change(payload: &JsonValue) -> Result<Self> {
        // Realtime servers nest the change under `data`; older ones inline it.
        let body = payload.get("data").unwrap_or(payload);
        let data: RowChangeData = serde_json::from_value(body.clone())
            .map_err(|e| malformed(ROW_CHANGE_EVENT, e))?;

        let row = match data.op {
            ChangeOp::Delete => data.old_record,
            ChangeOp::Insert | ChangeOp::Update => data.record,
        }
        .ok_or_else(|| malformed(ROW_CHANGE_EVENT, format!("{} without row", data.op)))?;

        Ok(Event::RowChanged {
            table: data.table,
            op: data.op,
            row,
        })
    }

    fn decode_broadcast(name: &str, payload: JsonValue) -> Result<Self> {
        match name {
            TYPING_START => {
                let p: TypingStartPayload =
                    serde_json::from_value(payload).map_err(|e| malformed(name, e))?;
                Ok(Event::TypingStart {
                    conversation_id: p.conversation_id,
                    user_id: p.user_id,
                    user_name: p.user_name,
                })
            },
            TYPING_STOP => {
                let p: TypingStopPayload =
                    serde_json::from_value(payload).map_err(|e| malformed(name, e))?;
                Ok(Event::TypingStop {
                    conversation_id: p.conversation_id,
                    user_id: p.user_id,
                })
            },
            HEARTBEAT => {
                let p: HeartbeatPayload =
                    serde_json::from_value(payload).map_err(|e| malformed(name, e))?;
                Ok(Event::Heartbeat {
                    user_id: p.user_id,
                    ts: p.ts,
                })
            },
            other => Err(malformed(other, "unknown broadcast event")),
        }
    }

    /// Broadcast event name and payload for outbound events.
    ///
    /// Returns `None` for row changes, which are never sent by clients.
    pub fn to_broadcast(&self) -> Option<(&'static str, JsonValue)> {
        let encoded = match self {
            Event::TypingStart {
                conversation_id,
                user_id,
                user_name,
            } => (
                TYPING_START,
                serde_json::to_value(TypingStartPayload {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.clone(),
                    user_name: user_name.clone(),
                }),
            ),
            Event::TypingStop {
                conversation_id,
                user_id,
            } => (
                TYPING_STOP,
                serde_json::to_value(TypingStopPayload {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.clone(),
                }),
            ),
            Event::Heartbeat { user_id, ts } => (
                HEARTBEAT,
                serde_json::to_value(HeartbeatPayload {
                    user_id: user_id.clone(),
                    ts: *ts,
                }),
            ),
            Event::RowChanged { .. } => return None,
        };
        match encoded {
            (name, Ok(value)) => Some((name, value)),
            (name, Err(e)) => {
                log::warn!("Failed to encode {} broadcast: {}", name, e);
                None
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::RowChanged { .. } => EventKind::RowChanged,
            Event::TypingStart { .. } => EventKind::TypingStart,
            Event::TypingStop { .. } => EventKind::TypingStop,
            Event::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }

    /// User that originated the event, if the event carries one.
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Event::TypingStart { user_id, .. }
            | Event::TypingStop { user_id, .. }
            | Event::Heartbeat { user_id, .. } => Some(user_id.as_str()),
            Event::RowChanged { .. } => None,
        }
    }
}
