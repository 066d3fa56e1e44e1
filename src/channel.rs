//! Channel handles and the registry that hands them out.
//!
//! A [`ChannelHandle`] wraps one logical subscription (a name plus a
//! [`ChannelSpec`]) on the shared transport. The [`ChannelRegistry`] keeps at
//! most one live handle per `(consumer, name)`: opening the same key while a
//! handle is `Subscribing` or `Active` returns that handle.
//!
//! Every handle carries a generation number and a closed flag. Callbacks run
//! only while the flag is clear, and `close()` waits for an in-flight
//! callback to finish before it returns, so nothing is delivered to a
//! consumer after its handle is closed.

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value as JsonValue;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

use crate::error::{RealtimeError, Result};
use crate::models::{ChannelInfo, ChannelSpec, ChannelState, Event, TransportStatus};
use crate::transport::{ChannelSender, RealtimeTransport, TransportFrame};

/// Identifies one consumer instance (one mounted hook or component).
pub type ConsumerId = u64;

/// Callback receiving decoded events.
pub type OnEvent = Arc<dyn Fn(Event) + Send + Sync>;

/// Callback receiving handle state transitions.
pub type OnStatus = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Current time in millis since Unix epoch.
#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// State transition reported through `on_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Generation of the handle that produced the update
    pub generation: u64,
    pub state: ChannelState,
    /// Transport status or error text for `Erroring`
    pub cause: Option<String>,
}

struct HandleInner {
    consumer: ConsumerId,
    name: String,
    spec: ChannelSpec,
    generation: u64,
    opened_at_ms: u64,
    state: Mutex<ChannelState>,
    last_event_at_ms: AtomicU64,
    sender: Mutex<Option<ChannelSender>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Closed flag. Held while a callback runs; reentrant so a callback may
    /// close its own handle.
    guard: ReentrantMutex<Cell<bool>>,
    on_event: OnEvent,
    on_status: OnStatus,
    registry: Weak<RegistryShared>,
}

impl HandleInner {
    fn transition(&self, next: ChannelState, cause: Option<String>) {
        let closed = self.guard.lock();
        if closed.get() {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        log::debug!(
            "[realtime-sync] channel '{}' (consumer={}, gen={}) -> {}{}",
            self.name,
            self.consumer,
            self.generation,
            next,
            cause.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default()
        );
        (self.on_status)(StatusUpdate {
            generation: self.generation,
            state: next,
            cause,
        });
    }

    fn deliver(&self, event_name: &str, payload: &JsonValue) {
        let event = match Event::decode(event_name, payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!(
                    "[realtime-sync] Dropping payload on channel '{}': {}",
                    self.name,
                    e
                );
                return;
            },
        };
        if !self.spec.accepts(&event) {
            log::debug!(
                "[realtime-sync] Channel '{}' ignoring unfiltered {} event",
                self.name,
                event.kind()
            );
            return;
        }

        let closed = self.guard.lock();
        if closed.get() {
            log::debug!(
                "[realtime-sync] Discarding {} for closed channel '{}' (gen={})",
                event.kind(),
                self.name,
                self.generation
            );
            return;
        }
        self.last_event_at_ms.store(now_ms(), Ordering::Relaxed);
        (self.on_event)(event);
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// One logical subscription. Cheap to clone; clones refer to the same handle.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ChannelHandle {}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("consumer", &self.inner.consumer)
            .field("name", &self.inner.name)
            .field("generation", &self.inner.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn consumer(&self) -> ConsumerId {
        self.inner.consumer
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.guard.lock().get()
    }

    pub fn info(&self) -> ChannelInfo {
        let last = self.inner.last_event_at_ms.load(Ordering::Relaxed);
        ChannelInfo {
            consumer: self.inner.consumer,
            name: self.inner.name.clone(),
            generation: self.inner.generation,
            state: self.state(),
            opened_at_ms: self.inner.opened_at_ms,
            last_event_at_ms: (last > 0).then_some(last),
        }
    }

    /// Broadcast an outbound event to the other members of the channel.
    pub async fn send(&self, event: &Event) -> Result<()> {
        let Some((name, payload)) = event.to_broadcast() else {
            return Err(RealtimeError::TransportError(format!(
                "{} events cannot be broadcast",
                event.kind()
            )));
        };
        if self.is_closed() {
            return Err(RealtimeError::ChannelClosed(self.inner.name.clone()));
        }
        if self.state() != ChannelState::Active {
            return Err(RealtimeError::NotConnected(format!(
                "channel '{}' is {}",
                self.inner.name,
                self.state()
            )));
        }
        let sender = self.inner.sender.lock().clone();
        match sender {
            Some(sender) => sender.broadcast(name, payload).await,
            None => Err(RealtimeError::NotConnected(self.inner.name.clone())),
        }
    }

    /// Tear the handle down. Safe to call any number of times.
    ///
    /// Reports `Closed` once, then no callback fires again for this handle.
    pub fn close(&self) {
        {
            let closed = self.inner.guard.lock();
            if closed.get() {
                return;
            }
            closed.set(true);
            *self.inner.state.lock() = ChannelState::Closed;
            (self.inner.on_status)(StatusUpdate {
                generation: self.inner.generation,
                state: ChannelState::Closed,
                cause: None,
            });
        }

        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        self.inner.sender.lock().take();

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.deregister(&self.key(), self.inner.generation);
        }
        log::debug!(
            "[realtime-sync] closed channel '{}' (consumer={}, gen={})",
            self.inner.name,
            self.inner.consumer,
            self.inner.generation
        );
    }

    fn key(&self) -> (ConsumerId, String) {
        (self.inner.consumer, self.inner.name.clone())
    }
}

async fn pump(weak: Weak<HandleInner>, transport: Arc<dyn RealtimeTransport>, spec: ChannelSpec) {
    let mut channel = match transport.join(spec).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Some(inner) = weak.upgrade() {
                inner.transition(ChannelState::Erroring, Some(e.to_string()));
            }
            return;
        },
    };

    match weak.upgrade() {
        Some(inner) => *inner.sender.lock() = Some(channel.sender()),
        None => return,
    }

    while let Some(frame) = channel.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match frame {
            TransportFrame::Status(TransportStatus::Subscribed) => {
                inner.transition(ChannelState::Active, None);
            },
            TransportFrame::Status(status) => {
                inner.transition(ChannelState::Erroring, Some(status.to_string()));
            },
            TransportFrame::Payload { event, payload } => inner.deliver(&event, &payload),
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.transition(
            ChannelState::Erroring,
            Some(TransportStatus::Closed.to_string()),
        );
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

struct RegistryShared {
    entries: Mutex<HashMap<(ConsumerId, String), ChannelHandle>>,
}

impl RegistryShared {
    fn deregister(&self, key: &(ConsumerId, String), generation: u64) {
        let mut entries = self.entries.lock();
        let is_current = entries
            .get(key)
            .is_some_and(|handle| handle.generation() == generation);
        if is_current {
            entries.remove(key);
        }
    }
}

/// Hands out channel handles over one shared transport.
#[derive(Clone)]
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    shared: Arc<RegistryShared>,
    next_generation: Arc<AtomicU64>,
    next_consumer: Arc<AtomicU64>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("transport", &self.transport.name())
            .field("channels", &self.shared.entries.lock().len())
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            shared: Arc::new(RegistryShared {
                entries: Mutex::new(HashMap::new()),
            }),
            next_generation: Arc::new(AtomicU64::new(1)),
            next_consumer: Arc::new(AtomicU64::new(1)),
        }
    }

    /// New consumer identity for keying channels.
    pub fn allocate_consumer(&self) -> ConsumerId {
        self.next_consumer.fetch_add(1, Ordering::Relaxed)
    }

    pub fn transport(&self) -> Arc<dyn RealtimeTransport> {
        self.transport.clone()
    }

    /// Open a channel, or return the live handle already registered for
    /// `(consumer, name)`. In the latter case the callbacks passed here are
    /// not used.
    ///
    /// Joining happens in a background task; the handle starts `Subscribing`.
    /// Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        consumer: ConsumerId,
        name: &str,
        spec: ChannelSpec,
        on_event: OnEvent,
        on_status: OnStatus,
    ) -> ChannelHandle {
        let key = (consumer, name.to_string());

        let (handle, stale) = {
            let mut entries = self.shared.entries.lock();
            if let Some(existing) = entries.get(&key) {
                if existing.state().is_live() && !existing.is_closed() {
                    log::debug!(
                        "[realtime-sync] channel '{}' (consumer={}) already {}; reusing gen={}",
                        name,
                        consumer,
                        existing.state(),
                        existing.generation()
                    );
                    return existing.clone();
                }
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let handle = ChannelHandle {
                inner: Arc::new(HandleInner {
                    consumer,
                    name: name.to_string(),
                    spec: spec.clone(),
                    generation,
                    opened_at_ms: now_ms(),
                    state: Mutex::new(ChannelState::Subscribing),
                    last_event_at_ms: AtomicU64::new(0),
                    sender: Mutex::new(None),
                    pump: Mutex::new(None),
                    guard: ReentrantMutex::new(Cell::new(false)),
                    on_event,
                    on_status,
                    registry: Arc::downgrade(&self.shared),
                }),
            };
            let stale = entries.insert(key, handle.clone());
            (handle, stale)
        };

        if let Some(stale) = stale {
            stale.close();
        }

        (handle.inner.on_status)(StatusUpdate {
            generation: handle.generation(),
            state: ChannelState::Subscribing,
            cause: None,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(pump(
                    Arc::downgrade(&handle.inner),
                    self.transport.clone(),
                    spec,
                ));
                *handle.inner.pump.lock() = Some(task);
            },
            Err(_) => {
                handle.inner.transition(
                    ChannelState::Erroring,
                    Some("no Tokio runtime to run the channel".to_string()),
                );
            },
        }

        log::debug!(
            "[realtime-sync] opened channel '{}' (consumer={}, gen={}) on {} transport",
            name,
            consumer,
            handle.generation(),
            self.transport.name()
        );
        handle
    }

    /// Close a handle. Idempotent.
    pub fn close(&self, handle: &ChannelHandle) {
        handle.close();
    }

    /// Close whatever is registered under `(consumer, name)`. No-op when
    /// nothing is.
    pub fn close_key(&self, consumer: ConsumerId, name: &str) {
        let handle = self
            .shared
            .entries
            .lock()
            .get(&(consumer, name.to_string()))
            .cloned();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Handle registered under `(consumer, name)`, if any.
    pub fn get(&self, consumer: ConsumerId, name: &str) -> Option<ChannelHandle> {
        self.shared
            .entries
            .lock()
            .get(&(consumer, name.to_string()))
            .cloned()
    }

    /// Snapshot of every registered channel, ordered by consumer and name.
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .shared
            .entries
            .lock()
            .values()
            .map(ChannelHandle::info)
            .collect();
        infos.sort_by(|a, b| (a.consumer, &a.name).cmp(&(b.consumer, &b.name)));
        infos
    }

    /// Number of handles currently `Subscribing` or `Active`.
    pub fn live_count(&self) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .filter(|handle| handle.state().is_live())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterSpec;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn noop_event() -> OnEvent {
        Arc::new(|_| {})
    }

    fn recording_status() -> (OnStatus, Arc<Mutex<Vec<ChannelState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (
            Arc::new(move |update: StatusUpdate| sink.lock().push(update.state)),
            seen,
        )
    }

    fn spec() -> ChannelSpec {
        ChannelSpec::new("projects", vec![FilterSpec::rows("projects")])
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_open_reports_subscribing_then_active() {
        let transport = MemoryTransport::new();
        let registry = ChannelRegistry::new(Arc::new(transport.clone()));
        let (on_status, seen) = recording_status();

        let handle = registry.open(1, "projects", spec(), noop_event(), on_status);
        settle().await;

        assert_eq!(handle.state(), ChannelState::Active);
        assert_eq!(
            *seen.lock(),
            vec![ChannelState::Subscribing, ChannelState::Active]
        );
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_open_is_idempotent_per_key() {
        let transport = MemoryTransport::new();
        let registry = ChannelRegistry::new(Arc::new(transport.clone()));

        let first = registry.open(1, "projects", spec(), noop_event(), recording_status().0);
        let second = registry.open(1, "projects", spec(), noop_event(), recording_status().0);
        settle().await;

        assert_eq!(first, second);
        assert_eq!(transport.join_count("projects"), 1);
        assert_eq!(transport.member_count("projects"), 1);

        // A different consumer gets its own handle
        let other = registry.open(2, "projects", spec(), noop_event(), recording_status().0);
        assert_ne!(first, other);
        assert_eq!(registry.list_channels().len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let transport = MemoryTransport::new();
        let registry = ChannelRegistry::new(Arc::new(transport.clone()));
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let (on_status, seen) = recording_status();

        let handle = registry.open(
            1,
            "projects",
            spec(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            on_status,
        );
        settle().await;

        let mut row = serde_json::Map::new();
        row.insert("id".into(), serde_json::json!("p1"));
        transport.publish_row_change("projects", "projects", crate::models::ChangeOp::Insert, row.clone());
        settle().await;
        assert_eq!(events.load(Ordering::SeqCst), 1);

        handle.close();
        handle.close();
        registry.close(&handle);
        registry.close_key(1, "projects");
        registry.close_key(9, "never-opened");

        transport.publish_row_change("projects", "projects", crate::models::ChangeOp::Insert, row);
        transport.push_status("projects", TransportStatus::ChannelError);
        settle().await;

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock(),
            vec![
                ChannelState::Subscribing,
                ChannelState::Active,
                ChannelState::Closed
            ]
        );
        assert!(handle.is_closed());
        assert!(registry.list_channels().is_empty());
        assert_eq!(transport.member_count("projects"), 0);
    }

    #[tokio::test]
    async fn test_reopen_after_error_replaces_handle() {
        let transport = MemoryTransport::new();
        let registry = ChannelRegistry::new(Arc::new(transport.clone()));

        let first = registry.open(1, "projects", spec(), noop_event(), recording_status().0);
        settle().await;
        transport.push_status("projects", TransportStatus::ChannelError);
        settle().await;
        assert_eq!(first.state(), ChannelState::Erroring);

        let second = registry.open(1, "projects", spec(), noop_event(), recording_status().0);
        settle().await;
        assert_ne!(first, second);
        assert!(first.is_closed());
        assert!(second.generation() > first.generation());
        assert_eq!(second.state(), ChannelState::Active);
        assert_eq!(transport.join_count("projects"), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let transport = MemoryTransport::new();
        let registry = ChannelRegistry::new(Arc::new(transport.clone()));
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();

        let handle = registry.open(
            1,
            "projects",
            spec(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            recording_status().0,
        );
        settle().await;

        transport.publish("projects", "postgres_changes", serde_json::json!({"garbage": true}));
        transport.publish("projects", "mystery", serde_json::json!({}));
        settle().await;

        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), ChannelState::Active);
        assert!(handle.info().last_event_at_ms.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_transport_reports_erroring() {
        let transport = MemoryTransport::new();
        transport.set_unreachable(true);
        let registry = ChannelRegistry::new(Arc::new(transport.clone()));
        let (on_status, seen) = recording_status();

        let handle = registry.open(1, "projects", spec(), noop_event(), on_status);
        settle().await;

        assert_eq!(handle.state(), ChannelState::Erroring);
        assert_eq!(
            *seen.lock(),
            vec![ChannelState::Subscribing, ChannelState::Erroring]
        );
        assert!(handle
            .send(&Event::Heartbeat {
                user_id: "u1".into(),
                ts: 1
            })
            .await
            .is_err());
    }
}
