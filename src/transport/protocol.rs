//! Phoenix-channel wire envelopes.
//!
//! Every frame is a JSON object `{topic, event, payload, ref, join_ref}`.
//! Channel topics are prefixed with `realtime:`; socket heartbeats use the
//! reserved `phoenix` topic.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{RealtimeError, Result};
use crate::models::{ChannelSpec, FilterSpec};

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_HEARTBEAT: &str = "heartbeat";
pub const PHOENIX_TOPIC: &str = "phoenix";
pub const SYSTEM_EVENT: &str = "system";
pub const PRESENCE_STATE: &str = "presence_state";
pub const PRESENCE_DIFF: &str = "presence_diff";

const TOPIC_PREFIX: &str = "realtime:";

/// Wire protocol version sent in the socket URL.
pub const PROTOCOL_VSN: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

/// Payload of a `phx_reply`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: JsonValue,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Reason the server gave for a rejected reply.
    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.response.to_string())
    }
}

/// `realtime:<topic>`
pub fn wire_topic(topic: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, topic)
}

/// Inverse of [`wire_topic`]. Topics without the prefix pass through.
pub fn local_topic(wire: &str) -> &str {
    wire.strip_prefix(TOPIC_PREFIX).unwrap_or(wire)
}

/// Join payload: broadcast config (`self` echo flag) plus row-change filters.
pub fn join_payload(spec: &ChannelSpec, access_token: Option<&str>) -> JsonValue {
    let changes: Vec<JsonValue> = spec
        .filters
        .iter()
        .filter_map(|filter| match filter {
            FilterSpec::RowChange {
                schema,
                table,
                op,
                filter,
            } => {
                let mut entry = json!({
                    "event": op.map_or("*", |op| op.as_str()),
                    "schema": schema,
                    "table": table,
                });
                if let Some(expression) = filter {
                    entry["filter"] = json!(expression);
                }
                Some(entry)
            },
            FilterSpec::Broadcast { .. } => None,
        })
        .collect();

    let mut payload = json!({
        "config": {
            "broadcast": { "self": spec.receive_own_broadcasts, "ack": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }
    payload
}

impl PhoenixMessage {
    pub fn join(spec: &ChannelSpec, access_token: Option<&str>, join_ref: u64) -> Self {
        Self {
            topic: wire_topic(&spec.topic),
            event: PHX_JOIN.to_string(),
            payload: join_payload(spec, access_token),
            msg_ref: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn leave(topic: &str, join_ref: u64, msg_ref: u64) -> Self {
        Self {
            topic: wire_topic(topic),
            event: PHX_LEAVE.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn broadcast(
        topic: &str,
        join_ref: u64,
        msg_ref: u64,
        event: &str,
        payload: JsonValue,
    ) -> Self {
        Self {
            topic: wire_topic(topic),
            event: crate::models::BROADCAST_EVENT.to_string(),
            payload: json!({
                "type": "broadcast",
                "event": event,
                "payload": payload,
            }),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn heartbeat(msg_ref: u64) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: PHX_HEARTBEAT.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            RealtimeError::SerializationError(format!("Failed to encode {}: {}", self.event, e))
        })
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| RealtimeError::MalformedPayload(format!("Invalid Phoenix frame: {}", e)))
    }

    /// Parsed `phx_reply` payload.
    pub fn reply(&self) -> Option<ReplyPayload> {
        if self.event != PHX_REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn join_ref_u64(&self) -> Option<u64> {
        self.join_ref.as_deref().and_then(|r| r.parse().ok())
    }
}
