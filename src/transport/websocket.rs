//! Shared WebSocket transport.
//!
//! Provides a single WebSocket connection multiplexed across every channel
//! in the process. Handles:
//!
//! - Lazy connect on the first join (and on the first join after a loss)
//! - Routing inbound Phoenix frames to the joined channel by topic and `join_ref`
//! - Sharing one server join per topic among every local subscriber; the
//!   server-side leave goes out with the last subscriber
//! - Join acknowledgement and join timeout (`subscribed` / `timed_out`)
//! - Heartbeats on the `phoenix` topic with a pong deadline
//! - Reporting socket loss to every joined channel as `channel_error`
//!
//! It never reconnects on its own; coordinators decide when to rejoin.

use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use reqwest::Url;
use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::header::{HeaderValue, AUTHORIZATION},
    protocol::Message,
};

use super::protocol::{
    local_topic, PhoenixMessage, PHOENIX_TOPIC, PHX_CLOSE, PHX_ERROR, PHX_REPLY, PRESENCE_DIFF,
    PRESENCE_STATE, PROTOCOL_VSN, SYSTEM_EVENT,
};
use super::{
    ChannelLink, RealtimeTransport, TransportChannel, TransportFrame,
    DEFAULT_FRAME_CHANNEL_CAPACITY, FAR_FUTURE,
};
use crate::auth::Credentials;
use crate::config::TransportSettings;
use crate::error::{RealtimeError, Result};
use crate::models::{ChannelSpec, TransportStatus};
use crate::timeouts::RealtimeTimeouts;

type WebSocketStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Maximum text message size (16 MiB).
const MAX_WS_TEXT_MESSAGE_BYTES: usize = 16 << 20;

static SHARED: OnceCell<Arc<WebSocketTransport>> = OnceCell::new();

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from channel handles to the background connection task.
enum WsCmd {
    Join {
        spec: ChannelSpec,
        frames_tx: mpsc::Sender<TransportFrame>,
        result_tx: oneshot::Sender<Result<u64>>,
    },
    Broadcast {
        topic: String,
        sub_ref: u64,
        event: String,
        payload: JsonValue,
        result_tx: oneshot::Sender<Result<()>>,
    },
    Leave {
        topic: String,
        sub_ref: u64,
    },
    Shutdown,
}

// ── Per-channel state ───────────────────────────────────────────────────────

/// One local handle on a topic. `sub_ref` is the id handed out by `join`.
struct Subscriber {
    sub_ref: u64,
    frames_tx: mpsc::Sender<TransportFrame>,
}

/// One server-side join, fanned out to every local subscriber of the topic.
struct ChannelEntry {
    join_ref: u64,
    spec: ChannelSpec,
    subscribers: Vec<Subscriber>,
    joined: bool,
    join_deadline: Option<TokioInstant>,
}

impl ChannelEntry {
    fn has_subscriber(&self, sub_ref: u64) -> bool {
        self.subscribers.iter().any(|sub| sub.sub_ref == sub_ref)
    }

    /// Non-blocking status for every subscriber, used when the entry is dropped.
    fn fail(&self, status: TransportStatus) {
        for sub in &self.subscribers {
            let _ = sub.frames_tx.try_send(TransportFrame::Status(status));
        }
    }
}

// ── Public handle ───────────────────────────────────────────────────────────

/// One multiplexed WebSocket per process.
///
/// Use [`WebSocketTransport::shared`] in applications; [`WebSocketTransport::new`]
/// creates a private instance (tests, tools talking to several servers).
pub struct WebSocketTransport {
    cmd_tx: mpsc::Sender<WsCmd>,
    connected: Arc<AtomicBool>,
    url: String,
    _task: JoinHandle<()>,
}

struct WsLink {
    cmd_tx: mpsc::Sender<WsCmd>,
}

#[async_trait::async_trait]
impl ChannelLink for WsLink {
    async fn broadcast(
        &self,
        topic: &str,
        join_ref: u64,
        event: &str,
        payload: JsonValue,
    ) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCmd::Broadcast {
                topic: topic.to_string(),
                sub_ref: join_ref,
                event: event.to_string(),
                payload,
                result_tx,
            })
            .await
            .map_err(|_| task_gone())?;
        result_rx.await.map_err(|_| task_gone())?
    }

    fn leave(&self, topic: &str, join_ref: u64) {
        let _ = self.cmd_tx.try_send(WsCmd::Leave {
            topic: topic.to_string(),
            sub_ref: join_ref,
        });
    }
}

fn task_gone() -> RealtimeError {
    RealtimeError::TransportError("Connection task is not running".to_string())
}

impl WebSocketTransport {
    /// Create a private transport. Must be called inside a Tokio runtime.
    ///
    /// Nothing connects until the first join.
    pub fn new(settings: TransportSettings, timeouts: RealtimeTimeouts) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::ConfigurationError(
                "WebSocketTransport must be created inside a Tokio runtime".to_string(),
            )
        })?;
        // Fail fast on a bad URL instead of on the first join
        let url = resolve_ws_url(&settings.url, &settings.credentials())?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCmd>(256);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = connected.clone();

        let task = runtime.spawn(async move {
            connection_task(cmd_rx, settings, timeouts, connected_clone).await;
        });

        Ok(Self {
            cmd_tx,
            connected,
            url: url.to_string(),
            _task: task,
        })
    }

    /// The process-wide transport. Initialized on first use with the given
    /// settings and never torn down; later calls return the same instance.
    pub fn shared(
        settings: &TransportSettings,
        timeouts: &RealtimeTimeouts,
    ) -> Result<Arc<WebSocketTransport>> {
        let transport = SHARED.get_or_try_init(|| {
            log::info!("[realtime-sync] Initializing shared WebSocket transport for {}", settings.url);
            WebSocketTransport::new(settings.clone(), timeouts.clone()).map(Arc::new)
        })?;
        Ok(transport.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Resolved socket URL (credentials in the query string are included).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the socket and stop the background task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(WsCmd::Shutdown).await;
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(WsCmd::Shutdown);
    }
}

#[async_trait::async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn join(&self, spec: ChannelSpec) -> Result<TransportChannel> {
        let (frames_tx, frames_rx) = mpsc::channel(DEFAULT_FRAME_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = oneshot::channel();
        let topic = spec.topic.clone();

        self.cmd_tx
            .send(WsCmd::Join {
                spec,
                frames_tx,
                result_tx,
            })
            .await
            .map_err(|_| task_gone())?;

        let sub_ref = result_rx.await.map_err(|_| {
            RealtimeError::TransportError(
                "Connection task died before confirming join".to_string(),
            )
        })??;

        let link: Arc<dyn ChannelLink> = Arc::new(WsLink {
            cmd_tx: self.cmd_tx.clone(),
        });
        Ok(TransportChannel::new(topic, sub_ref, frames_rx, link))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Turn the configured endpoint into the socket URL:
/// `http(s)` becomes `ws(s)`, `/websocket` is appended when missing, and the
/// protocol version plus any API key go into the query string.
pub(crate) fn resolve_ws_url(base_url: &str, credentials: &Credentials) -> Result<Url> {
    let mut url = Url::parse(base_url.trim()).map_err(|e| {
        RealtimeError::ConfigurationError(format!("Invalid realtime url '{}': {}", base_url, e))
    })?;

    let ws_scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::ConfigurationError(format!(
                "Unsupported realtime url scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        },
    };
    url.set_scheme(ws_scheme).map_err(|_| {
        RealtimeError::ConfigurationError(format!("Cannot use scheme {} for {}", ws_scheme, base_url))
    })?;

    let trimmed = url.path().trim_end_matches('/').to_string();
    if !trimmed.ends_with("/websocket") {
        url.set_path(&format!("{}/websocket", trimmed));
    }

    url.query_pairs_mut().append_pair("vsn", PROTOCOL_VSN);
    if let Some((key, value)) = credentials.ws_query_param() {
        url.query_pairs_mut().append_pair(key, value);
    }
    Ok(url)
}

/// Spread heartbeats of different processes talking to the same server.
/// +/-20% around `base`, stable per `seed`.
fn jitter_keepalive_interval(base: Duration, seed: &str) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms <= 1 {
        return base;
    }

    let jitter_span = (base_ms / 5).max(1);
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let hashed = hasher.finish();

    let offset = (hashed % (2 * jitter_span + 1)) as i64 - jitter_span as i64;
    let jittered_ms = if offset >= 0 {
        base_ms.saturating_add(offset as u64)
    } else {
        base_ms.saturating_sub((-offset) as u64).max(1)
    };

    Duration::from_millis(jittered_ms)
}

async fn establish_ws(
    settings: &TransportSettings,
    timeouts: &RealtimeTimeouts,
) -> Result<WebSocketStream> {
    let credentials = settings.credentials();
    let url = resolve_ws_url(&settings.url, &credentials)?;
    log::debug!("[realtime-sync] Establishing WebSocket connection to {}", url.host_str().unwrap_or(""));

    let mut request = url.as_str().into_client_request().map_err(|e| {
        RealtimeError::TransportError(format!("Failed to build WebSocket request: {}", e))
    })?;
    if let Credentials::Bearer(token) = &credentials {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            RealtimeError::ConfigurationError(format!("Invalid bearer token: {}", e))
        })?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let connect_result = if !RealtimeTimeouts::is_no_timeout(timeouts.connection_timeout) {
        tokio::time::timeout(
            timeouts.connection_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
    } else {
        Ok(tokio_tungstenite::connect_async(request).await)
    };

    match connect_result {
        Ok(Ok((stream, _))) => {
            log::info!("[realtime-sync] WebSocket connected");
            Ok(stream)
        },
        Ok(Err(tokio_tungstenite::tungstenite::error::Error::Http(response))) => {
            let status = response.status();
            let message = match status.as_u16() {
                401 => "Unauthorized: realtime socket requires valid credentials".to_string(),
                403 => "Forbidden: access to realtime socket denied".to_string(),
                code => format!("WebSocket HTTP error: {}", code),
            };
            Err(RealtimeError::TransportError(message))
        },
        Ok(Err(e)) => Err(RealtimeError::TransportError(format!("Connection failed: {}", e))),
        Err(_) => Err(RealtimeError::TimeoutError(format!(
            "Connection timeout ({:?})",
            timeouts.connection_timeout
        ))),
    }
}

async fn send_message(ws: &mut WebSocketStream, msg: &PhoenixMessage) -> Result<()> {
    let text = msg.encode()?;
    ws.send(Message::Text(text.into())).await.map_err(|e| {
        RealtimeError::TransportError(format!("Failed to send {}: {}", msg.event, e))
    })
}

/// Deliver a frame to every subscriber, dropping the ones that went away.
/// Returns false when nobody listens anymore.
async fn deliver(entry: &mut ChannelEntry, frame: TransportFrame) -> bool {
    let mut alive = Vec::with_capacity(entry.subscribers.len());
    for sub in entry.subscribers.drain(..) {
        if sub.frames_tx.send(frame.clone()).await.is_ok() {
            alive.push(sub);
        }
    }
    entry.subscribers = alive;
    !entry.subscribers.is_empty()
}

async fn notify(entry: &mut ChannelEntry, status: TransportStatus) -> bool {
    deliver(entry, TransportFrame::Status(status)).await
}

/// Detach one subscriber. Returns the entry to leave on the server when it
/// was the last one.
fn detach(
    channels: &mut HashMap<String, ChannelEntry>,
    topic: &str,
    sub_ref: u64,
) -> Option<ChannelEntry> {
    let Some(entry) = channels.get_mut(topic) else {
        log::debug!("[realtime-sync] Ignoring leave for unknown channel '{}'", topic);
        return None;
    };
    if !entry.has_subscriber(sub_ref) {
        log::debug!(
            "[realtime-sync] Ignoring stale leave for '{}' (sub_ref={})",
            topic,
            sub_ref
        );
        return None;
    }
    entry.subscribers.retain(|sub| sub.sub_ref != sub_ref);
    if entry.subscribers.is_empty() {
        channels.remove(topic)
    } else {
        None
    }
}

/// Every joined channel learns that the socket is gone.
fn fail_all_channels(channels: &mut HashMap<String, ChannelEntry>, reason: &str) {
    if !channels.is_empty() {
        log::warn!(
            "[realtime-sync] Socket lost ({}); failing {} channel(s)",
            reason,
            channels.len()
        );
    }
    for (_, entry) in channels.drain() {
        entry.fail(TransportStatus::ChannelError);
    }
}

struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_join(
    ws: &mut WebSocketStream,
    channels: &mut HashMap<String, ChannelEntry>,
    refs: &mut RefCounter,
    settings: &TransportSettings,
    timeouts: &RealtimeTimeouts,
    spec: ChannelSpec,
    frames_tx: mpsc::Sender<TransportFrame>,
    result_tx: oneshot::Sender<Result<u64>>,
) -> Result<()> {
    let topic = spec.topic.clone();
    let sub_ref = refs.next();

    if let Some(entry) = channels.get_mut(&topic) {
        if entry.spec != spec {
            log::warn!(
                "[realtime-sync] Channel '{}' is already joined with different filters",
                topic
            );
            let _ = result_tx.send(Err(RealtimeError::ConfigurationError(format!(
                "channel '{}' is already joined with different filters",
                topic
            ))));
            return Ok(());
        }
        if result_tx.send(Ok(sub_ref)).is_err() {
            return Ok(());
        }
        if entry.joined {
            let _ = frames_tx.try_send(TransportFrame::Status(TransportStatus::Subscribed));
        }
        entry.subscribers.push(Subscriber { sub_ref, frames_tx });
        log::debug!(
            "[realtime-sync] Sharing join of '{}' (join_ref={}, subscribers={})",
            topic,
            entry.join_ref,
            entry.subscribers.len()
        );
        return Ok(());
    }

    let join_ref = refs.next();
    let msg = PhoenixMessage::join(&spec, settings.access_token.as_deref(), join_ref);
    if let Err(e) = send_message(ws, &msg).await {
        let _ = result_tx.send(Err(e.clone()));
        return Err(e);
    }

    let join_deadline = if RealtimeTimeouts::is_no_timeout(timeouts.join_timeout) {
        None
    } else {
        Some(TokioInstant::now() + timeouts.join_timeout)
    };

    if result_tx.send(Ok(sub_ref)).is_err() {
        // Caller went away while we were joining
        log::debug!("[realtime-sync] Join caller for '{}' dropped; leaving", topic);
        let leave_ref = refs.next();
        return send_message(ws, &PhoenixMessage::leave(&topic, join_ref, leave_ref)).await;
    }

    log::debug!("[realtime-sync] Joining '{}' (join_ref={})", topic, join_ref);
    channels.insert(
        topic,
        ChannelEntry {
            join_ref,
            spec,
            subscribers: vec![Subscriber { sub_ref, frames_tx }],
            joined: false,
            join_deadline,
        },
    );
    Ok(())
}

/// Route one inbound frame. Returns an error only when writing to the socket
/// failed.
async fn route_message(
    msg: PhoenixMessage,
    ws: &mut WebSocketStream,
    channels: &mut HashMap<String, ChannelEntry>,
    refs: &mut RefCounter,
) -> Result<()> {
    if msg.topic == PHOENIX_TOPIC {
        return Ok(());
    }

    let topic = local_topic(&msg.topic).to_string();
    let Some(entry) = channels.get_mut(&topic) else {
        log::debug!("[realtime-sync] No channel for topic '{}' ({})", topic, msg.event);
        return Ok(());
    };

    if let Some(join_ref) = msg.join_ref_u64() {
        if join_ref != entry.join_ref {
            log::debug!(
                "[realtime-sync] Ignoring stale {} for '{}' (join_ref={}, current={})",
                msg.event,
                topic,
                join_ref,
                entry.join_ref
            );
            return Ok(());
        }
    }

    let mut remove = false;
    match msg.event.as_str() {
        PHX_REPLY => {
            let is_join_reply = !entry.joined
                && msg.msg_ref.as_deref() == Some(entry.join_ref.to_string().as_str());
            if is_join_reply {
                match msg.reply() {
                    Some(reply) if reply.is_ok() => {
                        entry.joined = true;
                        entry.join_deadline = None;
                        log::info!("[realtime-sync] Channel '{}' subscribed", topic);
                        remove = !notify(entry, TransportStatus::Subscribed).await;
                    },
                    Some(reply) => {
                        log::warn!(
                            "[realtime-sync] Join rejected for '{}': {}",
                            topic,
                            reply.reason()
                        );
                        notify(entry, TransportStatus::ChannelError).await;
                        remove = true;
                    },
                    None => {
                        log::warn!("[realtime-sync] Unreadable join reply for '{}'", topic);
                        notify(entry, TransportStatus::ChannelError).await;
                        remove = true;
                    },
                }
            }
        },
        PHX_ERROR => {
            log::warn!("[realtime-sync] Channel '{}' errored on the server", topic);
            notify(entry, TransportStatus::ChannelError).await;
            remove = true;
        },
        PHX_CLOSE => {
            log::debug!("[realtime-sync] Channel '{}' closed by the server", topic);
            notify(entry, TransportStatus::Closed).await;
            remove = true;
        },
        SYSTEM_EVENT => {
            let status = msg.payload.get("status").and_then(JsonValue::as_str);
            if status == Some("error") {
                log::warn!(
                    "[realtime-sync] System error on '{}': {}",
                    topic,
                    msg.payload.get("message").unwrap_or(&JsonValue::Null)
                );
                notify(entry, TransportStatus::ChannelError).await;
                remove = true;
            } else {
                log::debug!("[realtime-sync] System message on '{}': {}", topic, msg.payload);
            }
        },
        PRESENCE_STATE | PRESENCE_DIFF => {},
        _ => {
            let frame = TransportFrame::Payload {
                event: msg.event.clone(),
                payload: msg.payload,
            };
            if !deliver(entry, frame).await {
                log::debug!("[realtime-sync] Channel '{}' receivers dropped", topic);
                let leave_ref = refs.next();
                let join_ref = entry.join_ref;
                channels.remove(&topic);
                return send_message(ws, &PhoenixMessage::leave(&topic, join_ref, leave_ref)).await;
            }
        },
    }

    if remove {
        channels.remove(&topic);
    }
    Ok(())
}

// ── Background connection task ──────────────────────────────────────────────

async fn connection_task(
    mut cmd_rx: mpsc::Receiver<WsCmd>,
    settings: TransportSettings,
    timeouts: RealtimeTimeouts,
    connected: Arc<AtomicBool>,
) {
    let mut channels: HashMap<String, ChannelEntry> = HashMap::new();
    let mut ws_stream: Option<WebSocketStream> = None;
    let mut refs = RefCounter(0);

    let has_keepalive = !timeouts.keepalive_interval.is_zero();
    let keepalive_dur = if has_keepalive {
        jitter_keepalive_interval(timeouts.keepalive_interval, &settings.url)
    } else {
        FAR_FUTURE
    };
    let mut idle_deadline = TokioInstant::now() + keepalive_dur;

    let pong_timeout_dur = timeouts.pong_timeout;
    let has_pong_timeout = has_keepalive && !pong_timeout_dur.is_zero();
    let mut awaiting_pong = false;
    let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

    loop {
        let mut lost: Option<String> = None;

        if let Some(ref mut ws) = ws_stream {
            let idle_sleep = tokio::time::sleep_until(idle_deadline);
            tokio::pin!(idle_sleep);

            let pong_sleep = tokio::time::sleep_until(pong_deadline);
            tokio::pin!(pong_sleep);

            let join_deadline = channels
                .values()
                .filter_map(|entry| entry.join_deadline)
                .min();
            let join_sleep =
                tokio::time::sleep_until(join_deadline.unwrap_or(TokioInstant::now() + FAR_FUTURE));
            tokio::pin!(join_sleep);

            tokio::select! {
                biased;

                _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                    lost = Some(format!("heartbeat reply timeout ({:?})", pong_timeout_dur));
                }

                _ = &mut join_sleep, if join_deadline.is_some() => {
                    let now = TokioInstant::now();
                    let expired: Vec<String> = channels
                        .iter()
                        .filter(|(_, e)| e.join_deadline.is_some_and(|d| d <= now))
                        .map(|(topic, _)| topic.clone())
                        .collect();
                    for topic in expired {
                        if let Some(entry) = channels.remove(&topic) {
                            log::warn!("[realtime-sync] Join timed out for '{}'", topic);
                            entry.fail(TransportStatus::TimedOut);
                            let leave_ref = refs.next();
                            let leave = PhoenixMessage::leave(&topic, entry.join_ref, leave_ref);
                            if let Err(e) = send_message(ws, &leave).await {
                                lost = Some(e.to_string());
                                break;
                            }
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WsCmd::Join { spec, frames_tx, result_tx }) => {
                            if let Err(e) = handle_join(
                                ws, &mut channels, &mut refs, &settings, &timeouts,
                                spec, frames_tx, result_tx,
                            ).await {
                                lost = Some(e.to_string());
                            }
                        },
                        Some(WsCmd::Broadcast { topic, sub_ref, event, payload, result_tx }) => {
                            match channels.get(&topic).filter(|e| e.joined && e.has_subscriber(sub_ref)) {
                                None => {
                                    let _ = result_tx.send(Err(RealtimeError::NotConnected(format!(
                                        "channel '{}' is not joined", topic
                                    ))));
                                },
                                Some(entry) => {
                                    let msg_ref = refs.next();
                                    let msg = PhoenixMessage::broadcast(
                                        &topic, entry.join_ref, msg_ref, &event, payload.clone(),
                                    );
                                    let result = send_message(ws, &msg).await;
                                    match &result {
                                        Err(e) => lost = Some(e.to_string()),
                                        // The server never echoes to our own socket, so local
                                        // siblings on the topic get it from here
                                        Ok(()) => {
                                            for sub in entry.subscribers.iter().filter(|s| s.sub_ref != sub_ref) {
                                                let _ = sub.frames_tx.try_send(
                                                    TransportFrame::broadcast(&event, payload.clone()),
                                                );
                                            }
                                        },
                                    }
                                    let _ = result_tx.send(result);
                                },
                            }
                        },
                        Some(WsCmd::Leave { topic, sub_ref }) => {
                            if let Some(entry) = detach(&mut channels, &topic, sub_ref) {
                                let leave_ref = refs.next();
                                let leave = PhoenixMessage::leave(&topic, entry.join_ref, leave_ref);
                                if let Err(e) = send_message(ws, &leave).await {
                                    lost = Some(e.to_string());
                                }
                            }
                        },
                        Some(WsCmd::Shutdown) | None => {
                            for (topic, entry) in channels.drain() {
                                let leave_ref = refs.next();
                                let _ = send_message(ws, &PhoenixMessage::leave(&topic, entry.join_ref, leave_ref)).await;
                                entry.fail(TransportStatus::Closed);
                            }
                            let _ = ws.close(None).await;
                            connected.store(false, Ordering::SeqCst);
                            log::info!("[realtime-sync] WebSocket transport shut down");
                            return;
                        },
                    }
                }

                _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                    let msg_ref = refs.next();
                    if let Err(e) = send_message(ws, &PhoenixMessage::heartbeat(msg_ref)).await {
                        lost = Some(format!("heartbeat failed: {}", e));
                    } else {
                        if has_pong_timeout {
                            awaiting_pong = true;
                            pong_deadline = TokioInstant::now() + pong_timeout_dur;
                        }
                        idle_deadline = TokioInstant::now() + keepalive_dur;
                    }
                }

                frame = ws.next() => {
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                    if awaiting_pong {
                        awaiting_pong = false;
                        pong_deadline = TokioInstant::now() + FAR_FUTURE;
                    }

                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_WS_TEXT_MESSAGE_BYTES {
                                log::warn!("Text message too large ({} bytes)", text.len());
                            } else {
                                match PhoenixMessage::decode(&text) {
                                    Ok(msg) => {
                                        if let Err(e) = route_message(msg, ws, &mut channels, &mut refs).await {
                                            lost = Some(e.to_string());
                                        }
                                    },
                                    Err(e) => log::warn!("[realtime-sync] Dropping frame: {}", e),
                                }
                            }
                        },
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("[realtime-sync] Ignoring binary frame ({} bytes)", data.len());
                        },
                        Some(Ok(Message::Close(frame))) => {
                            lost = Some(match frame {
                                Some(f) => format!("server closed connection: {} ({})", f.reason, u16::from(f.code)),
                                None => "server closed connection".to_string(),
                            });
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        },
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {},
                        Some(Err(e)) => {
                            lost = Some(format!("WebSocket error: {}", e));
                        },
                        None => {
                            lost = Some("WebSocket stream ended".to_string());
                        },
                    }
                }
            }
        } else {
            // ── Not connected: wait for the next join ──────────────────
            match cmd_rx.recv().await {
                Some(WsCmd::Join {
                    spec,
                    frames_tx,
                    result_tx,
                }) => match establish_ws(&settings, &timeouts).await {
                    Ok(stream) => {
                        connected.store(true, Ordering::SeqCst);
                        idle_deadline = TokioInstant::now() + keepalive_dur;
                        awaiting_pong = false;
                        pong_deadline = TokioInstant::now() + FAR_FUTURE;
                        let ws = ws_stream.insert(stream);
                        if let Err(e) = handle_join(
                            ws,
                            &mut channels,
                            &mut refs,
                            &settings,
                            &timeouts,
                            spec,
                            frames_tx,
                            result_tx,
                        )
                        .await
                        {
                            lost = Some(e.to_string());
                        }
                    },
                    Err(e) => {
                        log::warn!("[realtime-sync] Connect failed: {}", e);
                        let _ = result_tx.send(Err(e));
                    },
                },
                Some(WsCmd::Broadcast { topic, result_tx, .. }) => {
                    let _ = result_tx.send(Err(RealtimeError::NotConnected(format!(
                        "socket is down; cannot broadcast on '{}'",
                        topic
                    ))));
                },
                Some(WsCmd::Leave { topic, sub_ref }) => {
                    detach(&mut channels, &topic, sub_ref);
                },
                Some(WsCmd::Shutdown) | None => return,
            }
        }

        if let Some(reason) = lost {
            fail_all_channels(&mut channels, &reason);
            connected.store(false, Ordering::SeqCst);
            awaiting_pong = false;
            pong_deadline = TokioInstant::now() + FAR_FUTURE;
            ws_stream = None;
        }
    }
}
