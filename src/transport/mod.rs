//! Push transports behind the channel registry.
//!
//! This module contains:
//! - [`RealtimeTransport`]: the contract every transport implements
//! - [`websocket`]: one multiplexed Phoenix-channel WebSocket per process
//! - [`memory`]: in-process hub with scripting hooks
//! - [`protocol`]: Phoenix envelope types used by the WebSocket transport
//!
//! A transport only reports statuses (`subscribed`, `channel_error`,
//! `timed_out`, `closed`); retry decisions live in the coordinator.

pub mod memory;
pub mod protocol;
pub mod websocket;

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{ChannelSpec, TransportStatus, BROADCAST_EVENT};

/// Default capacity for per-channel frame queues.
pub(crate) const DEFAULT_FRAME_CHANNEL_CAPACITY: usize = 1024;

/// A duration far enough in the future (~100 years) to act as "never" for
/// deadline calculations without overflowing `Instant::now() + dur`.
pub(crate) const FAR_FUTURE: std::time::Duration =
    std::time::Duration::from_secs(100 * 365 * 24 * 3600);

/// One item pushed by a transport to a joined channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Status(TransportStatus),
    Payload { event: String, payload: JsonValue },
}

impl TransportFrame {
    /// Inbound broadcast as the server delivers it to other members.
    pub(crate) fn broadcast(event: &str, payload: JsonValue) -> Self {
        TransportFrame::Payload {
            event: BROADCAST_EVENT.to_string(),
            payload: json!({
                "type": "broadcast",
                "event": event,
                "payload": payload,
            }),
        }
    }
}

/// Contract implemented by push transports.
///
/// `join` must not block on the server's acknowledgement: it registers the
/// channel and returns, and the acknowledgement (or failure) arrives later as
/// a [`TransportFrame::Status`]. It may fail outright when the transport
/// cannot reach the server at all.
#[async_trait::async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    async fn join(&self, spec: ChannelSpec) -> Result<TransportChannel>;

    /// Short identifier used in log lines.
    fn name(&self) -> &'static str;
}

/// Outbound half of a joined channel, implemented per transport.
#[async_trait::async_trait]
pub trait ChannelLink: Send + Sync + 'static {
    /// Send a broadcast message to the other members of the channel.
    async fn broadcast(&self, topic: &str, join_ref: u64, event: &str, payload: JsonValue)
        -> Result<()>;

    /// Leave the channel. Must not block.
    fn leave(&self, topic: &str, join_ref: u64);
}

/// Cloneable sender for one joined channel.
#[derive(Clone)]
pub struct ChannelSender {
    topic: String,
    join_ref: u64,
    link: Arc<dyn ChannelLink>,
}

impl ChannelSender {
    pub async fn broadcast(&self, event: &str, payload: JsonValue) -> Result<()> {
        self.link
            .broadcast(&self.topic, self.join_ref, event, payload)
            .await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("topic", &self.topic)
            .field("join_ref", &self.join_ref)
            .finish()
    }
}

/// A joined channel: inbound frames plus the outbound link.
///
/// Dropping it leaves the channel.
pub struct TransportChannel {
    sender: ChannelSender,
    frames: mpsc::Receiver<TransportFrame>,
    left: AtomicBool,
}

impl TransportChannel {
    pub fn new(
        topic: impl Into<String>,
        join_ref: u64,
        frames: mpsc::Receiver<TransportFrame>,
        link: Arc<dyn ChannelLink>,
    ) -> Self {
        Self {
            sender: ChannelSender {
                topic: topic.into(),
                join_ref,
                link,
            },
            frames,
            left: AtomicBool::new(false),
        }
    }

    /// Next frame, or `None` once the transport dropped the channel.
    pub async fn recv(&mut self) -> Option<TransportFrame> {
        self.frames.recv().await
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn topic(&self) -> &str {
        &self.sender.topic
    }

    pub fn join_ref(&self) -> u64 {
        self.sender.join_ref
    }

    /// Leave the channel. Idempotent.
    pub fn leave(&self) {
        if !self.left.swap(true, Ordering::SeqCst) {
            self.sender
                .link
                .leave(&self.sender.topic, self.sender.join_ref);
        }
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("topic", &self.sender.topic)
            .field("join_ref", &self.sender.join_ref)
            .field("left", &self.left.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.leave();
    }
}
