//! Lifecycle coordinator: owns one channel handle and keeps it alive.
//!
//! State machine per instance:
//!
//! ```text
//! Idle ──(ready identity)──▶ Subscribing ──(subscribed)──▶ Active
//!                               │                            │
//!                               └──(error/timeout/closed)──▶ Erroring
//!                                                            │
//!                      should_retry ──▶ backoff ──▶ Subscribing
//!                      exhausted    ──▶ Degraded (until a wake signal)
//!
//! any state ──(close)──▶ Closed
//! ```
//!
//! The coordinator runs as one task. Its inputs are handle status updates
//! (tagged with the handle generation; updates from older handles are
//! ignored), the session watch, the visibility and network watches, explicit
//! commands and the backoff timer. Wake signals (page visible, network
//! online, [`LifecycleCoordinator::wake`]) cancel any pending backoff and
//! resubscribe immediately with a fresh attempt counter.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

use crate::channel::{ChannelHandle, ChannelRegistry, ConsumerId, OnEvent, OnStatus, StatusUpdate};
use crate::context::RealtimeContext;
use crate::error::{RealtimeError, Result};
use crate::event_handlers::{ConnectionError, LifecycleHandlers};
use crate::models::{
    ChannelSpec, ChannelState, ConnectionStatus, Event, LifecycleState, ReconnectAttempt,
    UserIdentity,
};
use crate::reconnect::ReconnectPolicy;
use crate::session::SessionSnapshot;
use crate::signals::{NetworkState, Visibility};
use crate::transport::FAR_FUTURE;

/// What a coordinator does when the page is hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideBehavior {
    /// Tear the channel down; resubscribe when visible again.
    /// For live-feedback consumers (typing, presence).
    TearDown,
    /// Keep the channel. For consumers backing persistent data.
    StayActive,
}

/// Builds the channel spec for the signed-in user.
pub type SpecBuilder = Arc<dyn Fn(&UserIdentity) -> ChannelSpec + Send + Sync>;

/// Per-coordinator configuration.
#[derive(Clone)]
pub struct CoordinatorConfig {
    /// Logical channel name, unique per consumer
    pub name: String,
    pub spec: SpecBuilder,
    pub policy: ReconnectPolicy,
    pub hide_behavior: HideBehavior,
    pub handlers: LifecycleHandlers,
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("hide_behavior", &self.hide_behavior)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl CoordinatorConfig {
    /// Change-feed defaults: [`ReconnectPolicy::change_feed`], stays active
    /// while hidden.
    pub fn new(
        name: impl Into<String>,
        spec: impl Fn(&UserIdentity) -> ChannelSpec + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            spec: Arc::new(spec),
            policy: ReconnectPolicy::change_feed(),
            hide_behavior: HideBehavior::StayActive,
            handlers: LifecycleHandlers::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hide_behavior(mut self, hide_behavior: HideBehavior) -> Self {
        self.hide_behavior = hide_behavior;
        self
    }

    pub fn with_handlers(mut self, handlers: LifecycleHandlers) -> Self {
        self.handlers = handlers;
        self
    }
}

enum CoordinatorCmd {
    Wake,
}

// ── State shared between the public handle and the task ─────────────────────

struct Guarded {
    closed: Cell<bool>,
    current: RefCell<Option<ChannelHandle>>,
}

struct Shared {
    name: String,
    /// Held while lifecycle handlers run, so `close()` waits for them.
    guard: ReentrantMutex<Guarded>,
    status_tx: watch::Sender<ConnectionStatus>,
    handlers: LifecycleHandlers,
}

impl Shared {
    fn emit(&self, f: impl FnOnce(&LifecycleHandlers)) {
        let guard = self.guard.lock();
        if guard.closed.get() {
            return;
        }
        f(&self.handlers);
    }

    fn update_status(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        let guard = self.guard.lock();
        if guard.closed.get() {
            return;
        }
        self.status_tx.send_modify(f);
    }

    /// Install the new handle. Returns false (and closes it) when the
    /// coordinator was closed in the meantime.
    fn install(&self, handle: ChannelHandle) -> bool {
        let guard = self.guard.lock();
        if guard.closed.get() {
            drop(guard);
            handle.close();
            return false;
        }
        let previous = guard.current.borrow_mut().replace(handle);
        drop(guard);
        if let Some(previous) = previous {
            previous.close();
        }
        true
    }

    fn take_handle(&self) -> Option<ChannelHandle> {
        self.guard.lock().current.borrow_mut().take()
    }

    fn current_handle(&self) -> Option<ChannelHandle> {
        self.guard.lock().current.borrow().clone()
    }

    fn current_generation(&self) -> Option<u64> {
        self.guard
            .lock()
            .current
            .borrow()
            .as_ref()
            .map(ChannelHandle::generation)
    }

    fn is_closed(&self) -> bool {
        self.guard.lock().closed.get()
    }
}

// ── Public handle ───────────────────────────────────────────────────────────

/// Owns exactly one channel handle at a time and reconnects it.
///
/// Dropping the coordinator closes it.
pub struct LifecycleCoordinator {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<CoordinatorCmd>,
    status_rx: watch::Receiver<ConnectionStatus>,
    consumer: ConsumerId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("name", &self.shared.name)
            .field("consumer", &self.consumer)
            .field("status", &*self.status_rx.borrow())
            .finish()
    }
}

impl LifecycleCoordinator {
    /// Start the coordinator task. Subscribes as soon as a ready identity is
    /// available. Must be called from within a Tokio runtime.
    pub fn mount(ctx: &RealtimeContext, config: CoordinatorConfig, on_event: OnEvent) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::ConfigurationError(
                "LifecycleCoordinator must be mounted inside a Tokio runtime".to_string(),
            )
        })?;

        let registry = ctx.registry().clone();
        let consumer = registry.allocate_consumer();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            guard: ReentrantMutex::new(Guarded {
                closed: Cell::new(false),
                current: RefCell::new(None),
            }),
            status_tx,
            handlers: config.handlers.clone(),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            shared: shared.clone(),
            registry,
            consumer,
            config,
            on_event,
            msg_tx,
            state: LifecycleState::Idle,
            attempts: 0,
            backoff_until: None,
            identity: None,
            visibility: Visibility::Visible,
            network: NetworkState::Online,
            degraded_reported: false,
        };
        let inputs = Inputs {
            cmd_rx,
            msg_rx,
            session_rx: ctx.session().subscribe(),
            visibility_rx: ctx.signals().subscribe_visibility(),
            network_rx: ctx.signals().subscribe_network(),
        };

        log::debug!(
            "[realtime-sync] mounting coordinator '{}' (consumer={})",
            shared.name,
            consumer
        );
        let task = runtime.spawn(actor.run(inputs));

        Ok(Self {
            shared,
            cmd_tx,
            status_rx,
            consumer,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.status_rx.borrow().state
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// The handle currently owned, if any.
    pub fn current_handle(&self) -> Option<ChannelHandle> {
        self.shared.current_handle()
    }

    /// External wake: resubscribe now unless already subscribing or active.
    pub fn wake(&self) {
        let _ = self.cmd_tx.send(CoordinatorCmd::Wake);
    }

    /// Broadcast an event through the owned channel.
    pub async fn send(&self, event: &Event) -> Result<()> {
        if self.shared.is_closed() {
            return Err(RealtimeError::ChannelClosed(self.shared.name.clone()));
        }
        match self.shared.current_handle() {
            Some(handle) => handle.send(event).await,
            None => Err(RealtimeError::NotConnected(format!(
                "coordinator '{}' has no channel",
                self.shared.name
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Unmount. Closes the owned handle, stops the task (dropping its timers
    /// and signal receivers) and reports `Closed`. Idempotent.
    ///
    /// When this returns, no handler or event callback of this coordinator
    /// runs again.
    pub fn close(&self) {
        let handle = {
            let guard = self.shared.guard.lock();
            if guard.closed.get() {
                return;
            }
            guard.closed.set(true);
            self.shared.status_tx.send_modify(|status| {
                status.state = LifecycleState::Closed;
                status.connected = false;
            });
            self.shared.handlers.emit_state(LifecycleState::Closed);
            let handle = guard.current.borrow_mut().take();
            handle
        };

        if let Some(handle) = handle {
            handle.close();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        log::debug!(
            "[realtime-sync] coordinator '{}' (consumer={}) closed",
            self.shared.name,
            self.consumer
        );
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Background task ─────────────────────────────────────────────────────────

struct Inputs {
    cmd_rx: mpsc::UnboundedReceiver<CoordinatorCmd>,
    msg_rx: mpsc::UnboundedReceiver<StatusUpdate>,
    session_rx: watch::Receiver<SessionSnapshot>,
    visibility_rx: watch::Receiver<Visibility>,
    network_rx: watch::Receiver<NetworkState>,
}

struct Actor {
    shared: Arc<Shared>,
    registry: ChannelRegistry,
    consumer: ConsumerId,
    config: CoordinatorConfig,
    on_event: OnEvent,
    msg_tx: mpsc::UnboundedSender<StatusUpdate>,
    state: LifecycleState,
    attempts: u32,
    backoff_until: Option<TokioInstant>,
    identity: Option<UserIdentity>,
    visibility: Visibility,
    network: NetworkState,
    degraded_reported: bool,
}

impl Actor {
    async fn run(mut self, mut inputs: Inputs) {
        self.identity = inputs.session_rx.borrow_and_update().identity().cloned();
        self.visibility = *inputs.visibility_rx.borrow_and_update();
        self.network = *inputs.network_rx.borrow_and_update();

        if self.can_subscribe() {
            self.subscribe("mount");
        }

        let mut session_open = true;
        let mut visibility_open = true;
        let mut network_open = true;

        loop {
            let backoff = tokio::time::sleep_until(
                self.backoff_until
                    .unwrap_or_else(|| TokioInstant::now() + FAR_FUTURE),
            );
            tokio::pin!(backoff);

            tokio::select! {
                biased;

                Some(update) = inputs.msg_rx.recv() => {
                    self.on_handle_status(update);
                }

                cmd = inputs.cmd_rx.recv() => {
                    match cmd {
                        Some(CoordinatorCmd::Wake) => self.wake("explicit wake"),
                        None => break,
                    }
                }

                changed = inputs.session_rx.changed(), if session_open => {
                    if changed.is_err() {
                        session_open = false;
                        continue;
                    }
                    let identity = inputs.session_rx.borrow_and_update().identity().cloned();
                    self.on_session(identity);
                }

                changed = inputs.visibility_rx.changed(), if visibility_open => {
                    if changed.is_err() {
                        visibility_open = false;
                        continue;
                    }
                    let visibility = *inputs.visibility_rx.borrow_and_update();
                    self.on_visibility(visibility);
                }

                changed = inputs.network_rx.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let network = *inputs.network_rx.borrow_and_update();
                    self.on_network(network);
                }

                _ = &mut backoff, if self.backoff_until.is_some() => {
                    self.backoff_until = None;
                    if self.can_subscribe() {
                        self.subscribe("backoff elapsed");
                    } else {
                        log::debug!(
                            "[realtime-sync] '{}' backoff elapsed but subscribing is not allowed now",
                            self.config.name
                        );
                    }
                }
            }
        }
    }

    fn can_subscribe(&self) -> bool {
        self.identity.is_some()
            && self.network == NetworkState::Online
            && !(self.config.hide_behavior == HideBehavior::TearDown
                && self.visibility == Visibility::Hidden)
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.shared.update_status(|status| status.state = state);
        self.shared.emit(|handlers| handlers.emit_state(state));
    }

    fn close_current(&self) {
        if let Some(handle) = self.shared.take_handle() {
            handle.close();
        }
    }

    fn subscribe(&mut self, reason: &str) {
        self.backoff_until = None;
        let Some(identity) = self.identity.clone() else {
            return;
        };
        self.close_current();

        log::debug!(
            "[realtime-sync] '{}' subscribing ({}, attempt {})",
            self.config.name,
            reason,
            self.attempts
        );
        let spec = (self.config.spec)(&identity);
        let msg_tx = self.msg_tx.clone();
        let on_status: OnStatus = Arc::new(move |update| {
            let _ = msg_tx.send(update);
        });
        let handle = self.registry.open(
            self.consumer,
            &self.config.name,
            spec,
            self.on_event.clone(),
            on_status,
        );
        if self.shared.install(handle) {
            self.set_state(LifecycleState::Subscribing);
        }
    }

    fn on_handle_status(&mut self, update: StatusUpdate) {
        if self.shared.current_generation() != Some(update.generation) {
            log::debug!(
                "[realtime-sync] '{}' ignoring {} from stale handle gen={}",
                self.config.name,
                update.state,
                update.generation
            );
            return;
        }

        match update.state {
            ChannelState::Active => {
                self.attempts = 0;
                self.degraded_reported = false;
                self.set_state(LifecycleState::Active);
                self.shared.update_status(|status| {
                    status.connected = true;
                    status.last_connected_at = Some(chrono::Utc::now());
                    status.reconnect_attempts = 0;
                    status.error = None;
                    status.degraded = false;
                });
                log::info!("[realtime-sync] '{}' active", self.config.name);
                self.shared.emit(|handlers| handlers.emit_connect());
            },
            ChannelState::Erroring => {
                let cause = update
                    .cause
                    .unwrap_or_else(|| "channel_error".to_string());
                self.on_failure(cause);
            },
            ChannelState::Idle | ChannelState::Subscribing | ChannelState::Closed => {},
        }
    }

    fn on_failure(&mut self, cause: String) {
        self.close_current();
        self.set_state(LifecycleState::Erroring);
        self.shared.update_status(|status| {
            status.connected = false;
            status.error = Some(cause.clone());
        });

        let policy = &self.config.policy;
        let recoverable = policy.should_retry(self.attempts);
        self.shared
            .emit(|handlers| handlers.emit_error(ConnectionError::new(cause.clone(), recoverable)));

        if !recoverable {
            self.degrade(cause);
            return;
        }

        let delay = policy.next_delay(self.attempts);
        self.attempts += 1;
        self.backoff_until = Some(TokioInstant::now() + delay);

        let attempts = self.attempts;
        self.shared
            .update_status(|status| status.reconnect_attempts = attempts);

        log::info!(
            "[realtime-sync] '{}' {}; retry {}/{} in {}ms",
            self.config.name,
            cause,
            attempts,
            policy.max_attempts,
            delay.as_millis()
        );
        let attempt = ReconnectAttempt {
            count: attempts,
            last_cause: Some(cause),
            next_delay_ms: delay.as_millis() as u64,
        };
        self.shared
            .emit(|handlers| handlers.emit_reconnect_scheduled(attempt));
    }

    fn degrade(&mut self, cause: String) {
        self.backoff_until = None;
        self.set_state(LifecycleState::Degraded);
        self.shared.update_status(|status| {
            status.degraded = true;
            status.connected = false;
        });
        if self.degraded_reported {
            return;
        }
        self.degraded_reported = true;
        log::warn!(
            "[realtime-sync] '{}' degraded after {} attempt(s): {}",
            self.config.name,
            self.attempts,
            cause
        );
        let status = self.shared.status_tx.borrow().clone();
        self.shared.emit(|handlers| handlers.emit_degraded(status));
    }

    fn wake(&mut self, reason: &str) {
        // A pending join is never restarted; a stuck one ends at the
        // transport's join timeout and then follows the normal retry path.
        if matches!(
            self.state,
            LifecycleState::Active | LifecycleState::Subscribing | LifecycleState::Closed
        ) {
            return;
        }
        if !self.can_subscribe() {
            return;
        }
        log::info!(
            "[realtime-sync] '{}' woken ({}) from {}; resubscribing now",
            self.config.name,
            reason,
            self.state
        );
        self.attempts = 0;
        self.degraded_reported = false;
        self.shared.update_status(|status| {
            status.reconnect_attempts = 0;
            status.degraded = false;
        });
        self.subscribe(reason);
    }

    /// Drop the channel without reporting an error.
    fn pause(&mut self, reason: &str) {
        log::debug!("[realtime-sync] '{}' paused ({})", self.config.name, reason);
        self.close_current();
        self.backoff_until = None;
        self.attempts = 0;
        self.set_state(LifecycleState::Idle);
        self.shared.update_status(|status| {
            status.connected = false;
            status.reconnect_attempts = 0;
            status.error = None;
        });
    }

    fn on_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
        match visibility {
            Visibility::Hidden => {
                if self.config.hide_behavior == HideBehavior::TearDown
                    && self.state != LifecycleState::Idle
                {
                    self.pause("page hidden");
                }
            },
            Visibility::Visible => self.wake("page visible"),
        }
    }

    fn on_network(&mut self, network: NetworkState) {
        self.network = network;
        match network {
            NetworkState::Online => self.wake("network online"),
            NetworkState::Offline => {
                log::debug!("[realtime-sync] '{}' network offline", self.config.name);
            },
        }
    }

    fn on_session(&mut self, identity: Option<UserIdentity>) {
        let previous = self.identity.as_ref().map(|u| u.user_id.clone());
        let next = identity.as_ref().map(|u| u.user_id.clone());
        self.identity = identity;
        if previous == next {
            return;
        }

        match next {
            None => {
                log::info!(
                    "[realtime-sync] '{}' identity cleared; tearing down",
                    self.config.name
                );
                self.degraded_reported = false;
                self.pause("signed out");
                self.shared.update_status(|status| status.degraded = false);
            },
            Some(user_id) => {
                log::debug!(
                    "[realtime-sync] '{}' identity is now {}",
                    self.config.name,
                    user_id
                );
                self.attempts = 0;
                self.degraded_reported = false;
                if self.can_subscribe() {
                    self.subscribe("identity changed");
                } else {
                    self.pause("identity changed while paused");
                }
            },
        }
    }
}
