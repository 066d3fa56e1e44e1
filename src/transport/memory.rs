//! In-process transport.
//!
//! Implements the same contract as the WebSocket transport against a local
//! hub. The hub can be scripted: acknowledge or reject joins, push statuses,
//! publish row changes and broadcasts as if they came from the server or from
//! another client.

use parking_lot::Mutex;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{
    ChannelLink, RealtimeTransport, TransportChannel, TransportFrame,
    DEFAULT_FRAME_CHANNEL_CAPACITY,
};
use crate::error::{RealtimeError, Result};
use crate::models::{ChangeOp, ChannelSpec, TransportStatus, BROADCAST_EVENT, ROW_CHANGE_EVENT};

/// A broadcast recorded by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct SentBroadcast {
    pub topic: String,
    pub event: String,
    pub payload: JsonValue,
}

struct Member {
    join_ref: u64,
    spec: ChannelSpec,
    frames_tx: mpsc::Sender<TransportFrame>,
}

#[derive(Default)]
struct HubState {
    members: HashMap<String, Vec<Member>>,
    join_counts: HashMap<String, u32>,
    failing_joins: u32,
    sent: Vec<SentBroadcast>,
}

struct MemoryHub {
    state: Mutex<HubState>,
    auto_ack: AtomicBool,
    unreachable: AtomicBool,
    next_ref: AtomicU64,
}

#[async_trait::async_trait]
impl ChannelLink for MemoryHub {
    async fn broadcast(
        &self,
        topic: &str,
        join_ref: u64,
        event: &str,
        payload: JsonValue,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let is_member = state
            .members
            .get(topic)
            .is_some_and(|members| members.iter().any(|m| m.join_ref == join_ref));
        if !is_member {
            return Err(RealtimeError::NotConnected(format!(
                "channel '{}' is not joined",
                topic
            )));
        }

        state.sent.push(SentBroadcast {
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        });

        if let Some(members) = state.members.get(topic) {
            for member in members {
                if member.join_ref == join_ref && !member.spec.receive_own_broadcasts {
                    continue;
                }
                let _ = member
                    .frames_tx
                    .try_send(TransportFrame::broadcast(event, payload.clone()));
            }
        }
        Ok(())
    }

    fn leave(&self, topic: &str, join_ref: u64) {
        let mut state = self.state.lock();
        if let Some(members) = state.members.get_mut(topic) {
            members.retain(|m| m.join_ref != join_ref);
            if members.is_empty() {
                state.members.remove(topic);
            }
        }
    }
}

/// Scriptable in-process transport. Clones share one hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Hub that acknowledges every join immediately.
    pub fn new() -> Self {
        Self {
            hub: Arc::new(MemoryHub {
                state: Mutex::new(HubState::default()),
                auto_ack: AtomicBool::new(true),
                unreachable: AtomicBool::new(false),
                next_ref: AtomicU64::new(1),
            }),
        }
    }

    /// When false, joins stay pending until [`ack`](Self::ack) is called.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.hub.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Reject the next `count` joins with `channel_error`.
    pub fn fail_next_joins(&self, count: u32) {
        self.hub.state.lock().failing_joins = count;
    }

    /// When true, `join` fails outright as if the server were unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.hub.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Acknowledge every pending member of `topic`.
    pub fn ack(&self, topic: &str) {
        self.push_status(topic, TransportStatus::Subscribed);
    }

    /// Push a status to every member of `topic`. Any status other than
    /// `subscribed` also drops the members, as a server would.
    pub fn push_status(&self, topic: &str, status: TransportStatus) {
        let mut state = self.hub.state.lock();
        let Some(members) = state.members.get(topic) else {
            return;
        };
        for member in members {
            let _ = member.frames_tx.try_send(TransportFrame::Status(status));
        }
        if status != TransportStatus::Subscribed {
            state.members.remove(topic);
        }
    }

    /// Deliver a raw server push to every member of `topic`.
    /// Returns how many members received it.
    pub fn publish(&self, topic: &str, event: &str, payload: JsonValue) -> usize {
        let state = self.hub.state.lock();
        let Some(members) = state.members.get(topic) else {
            return 0;
        };
        members
            .iter()
            .filter(|member| {
                member
                    .frames_tx
                    .try_send(TransportFrame::Payload {
                        event: event.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Deliver a row-change push in the server's wire shape.
    pub fn publish_row_change(
        &self,
        topic: &str,
        table: &str,
        op: ChangeOp,
        row: Map<String, JsonValue>,
    ) -> usize {
        let (record, old_record) = match op {
            ChangeOp::Delete => (JsonValue::Null, JsonValue::Object(row)),
            ChangeOp::Insert | ChangeOp::Update => (JsonValue::Object(row), JsonValue::Null),
        };
        let payload = json!({
            "data": {
                "schema": "public",
                "table": table,
                "type": op.as_str(),
                "record": record,
                "old_record": old_record,
            }
        });
        self.publish(topic, ROW_CHANGE_EVENT, payload)
    }

    /// Deliver a broadcast as if another client had sent it.
    pub fn publish_broadcast(&self, topic: &str, event: &str, payload: JsonValue) -> usize {
        self.publish(
            topic,
            BROADCAST_EVENT,
            json!({"type": "broadcast", "event": event, "payload": payload}),
        )
    }

    /// Number of joins attempted for `topic`, including rejected ones.
    pub fn join_count(&self, topic: &str) -> u32 {
        self.hub
            .state
            .lock()
            .join_counts
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Number of members currently joined to `topic`.
    pub fn member_count(&self, topic: &str) -> usize {
        self.hub
            .state
            .lock()
            .members
            .get(topic)
            .map_or(0, |members| members.len())
    }

    /// Every broadcast sent by members, in order.
    pub fn sent_broadcasts(&self) -> Vec<SentBroadcast> {
        self.hub.state.lock().sent.clone()
    }
}

#[async_trait::async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn join(&self, spec: ChannelSpec) -> Result<TransportChannel> {
        if self.hub.unreachable.load(Ordering::SeqCst) {
            return Err(RealtimeError::TransportError(
                "memory transport is unreachable".to_string(),
            ));
        }

        let join_ref = self.hub.next_ref.fetch_add(1, Ordering::SeqCst);
        let (frames_tx, frames_rx) = mpsc::channel(DEFAULT_FRAME_CHANNEL_CAPACITY);
        let topic = spec.topic.clone();

        {
            let mut state = self.hub.state.lock();
            *state.join_counts.entry(topic.clone()).or_insert(0) += 1;

            if state.failing_joins > 0 {
                state.failing_joins -= 1;
                log::debug!("[memory-transport] rejecting join for '{}'", topic);
                let _ = frames_tx.try_send(TransportFrame::Status(TransportStatus::ChannelError));
            } else {
                if self.hub.auto_ack.load(Ordering::SeqCst) {
                    let _ = frames_tx.try_send(TransportFrame::Status(TransportStatus::Subscribed));
                }
                state.members.entry(topic.clone()).or_default().push(Member {
                    join_ref,
                    spec,
                    frames_tx,
                });
            }
        }

        let link: Arc<dyn ChannelLink> = self.hub.clone();
        Ok(TransportChannel::new(topic, join_ref, frames_rx, link))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
