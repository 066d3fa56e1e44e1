//! Presence publisher: periodic "last seen active" touches.
//!
//! While a ready identity exists, the page is visible, the network is online
//! and the user has produced input within the inactivity timeout, the
//! publisher touches the presence endpoint on a fixed interval and
//! immediately on every wake. A 401 means the session is not ready (or has
//! expired) and is ignored. Other failures are retried with backoff a
//! bounded number of times, then dropped.
//!
//! Optionally the publisher also joins a presence channel: it broadcasts a
//! `heartbeat` after each successful touch and reports heartbeats of other
//! users through `on_heartbeat`.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::OnEvent;
use crate::context::RealtimeContext;
use crate::coordinator::{CoordinatorConfig, HideBehavior, LifecycleCoordinator};
use crate::error::{RealtimeError, Result};
use crate::event_handlers::LifecycleHandlers;
use crate::http::PresenceApi;
use crate::models::{ChannelSpec, Event, FilterSpec, UserIdentity, HEARTBEAT};
use crate::reconnect::ReconnectPolicy;
use crate::session::SessionSnapshot;
use crate::signals::{ActivityKind, NetworkState, Visibility};
use crate::transport::FAR_FUTURE;

/// Why the publisher is or is not publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Publishing,
    /// No ready identity
    SignedOut,
    PausedHidden,
    PausedOffline,
    /// No input within the inactivity timeout
    PausedInactive,
    Closed,
}

/// Callback for heartbeats of other users: `(user_id, ts)`.
pub type OnHeartbeat = Arc<dyn Fn(String, i64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PresenceOptions {
    /// Presence channel topic for heartbeat broadcasts; none disables the
    /// channel entirely
    pub channel: Option<String>,
    pub on_heartbeat: Option<OnHeartbeat>,
    /// Lifecycle handlers of the presence channel
    pub handlers: LifecycleHandlers,
}

impl fmt::Debug for PresenceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceOptions")
            .field("channel", &self.channel)
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .finish()
    }
}

impl PresenceOptions {
    pub fn channel(mut self, topic: impl Into<String>) -> Self {
        self.channel = Some(topic.into());
        self
    }

    pub fn on_heartbeat(mut self, f: impl Fn(String, i64) + Send + Sync + 'static) -> Self {
        self.on_heartbeat = Some(Arc::new(f));
        self
    }

    pub fn handlers(mut self, handlers: LifecycleHandlers) -> Self {
        self.handlers = handlers;
        self
    }
}

/// Channel spec for presence heartbeats.
pub fn presence_spec(topic: &str) -> ChannelSpec {
    ChannelSpec::new(topic, vec![FilterSpec::broadcast(HEARTBEAT)])
}

enum PresenceCmd {
    Wake,
}

/// Heartbeat publisher for the signed-in user.
///
/// Dropping the publisher unmounts it.
pub struct PresencePublisher {
    state_tx: Arc<watch::Sender<PresenceState>>,
    state_rx: watch::Receiver<PresenceState>,
    cmd_tx: mpsc::UnboundedSender<PresenceCmd>,
    heartbeats: Option<Arc<LifecycleCoordinator>>,
    guard: Arc<ReentrantMutex<Cell<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PresencePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresencePublisher")
            .field("state", &*self.state_rx.borrow())
            .field("heartbeats", &self.heartbeats)
            .finish()
    }
}

impl PresencePublisher {
    /// Start publishing. Requires a presence API on the context.
    pub fn mount(ctx: &RealtimeContext, options: PresenceOptions) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::ConfigurationError(
                "PresencePublisher must be mounted inside a Tokio runtime".to_string(),
            )
        })?;
        let api = ctx.presence_api().ok_or_else(|| {
            RealtimeError::ConfigurationError(
                "presence publishing requires an HTTP collaborator (http.base_url)".to_string(),
            )
        })?;

        let guard = Arc::new(ReentrantMutex::new(Cell::new(false)));

        let heartbeats = match &options.channel {
            Some(topic) => {
                let session = ctx.session().clone();
                let on_heartbeat = options.on_heartbeat.clone();
                let on_event: OnEvent = Arc::new(move |event| {
                    let Event::Heartbeat { user_id, ts } = event else {
                        return;
                    };
                    if session.snapshot().user_id() == Some(user_id.as_str()) {
                        return;
                    }
                    if let Some(callback) = &on_heartbeat {
                        callback(user_id, ts);
                    }
                });
                let spec_topic = topic.clone();
                let config = CoordinatorConfig::new("presence", move |_| presence_spec(&spec_topic))
                    .with_policy(ctx.policies().ephemeral.clone())
                    .with_hide_behavior(HideBehavior::TearDown)
                    .with_handlers(options.handlers.clone());
                Some(Arc::new(LifecycleCoordinator::mount(ctx, config, on_event)?))
            },
            None => None,
        };

        let (state_tx, state_rx) = watch::channel(PresenceState::SignedOut);
        let state_tx = Arc::new(state_tx);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let timeouts = ctx.timeouts();
        let worker = PresenceWorker {
            api,
            policy: ctx.policies().presence.clone(),
            heartbeats: heartbeats.as_ref().map(Arc::downgrade),
            state_tx: state_tx.clone(),
            guard: guard.clone(),
            interval: timeouts.heartbeat_interval,
            inactivity_timeout: timeouts.inactivity_timeout,
            identity: None,
            visibility: Visibility::Visible,
            network: NetworkState::Online,
            inactive: false,
            next_touch: None,
            inactive_at: Instant::now() + timeouts.inactivity_timeout,
            in_flight: None,
        };
        let inputs = PresenceInputs {
            cmd_rx,
            session_rx: ctx.session().subscribe(),
            visibility_rx: ctx.signals().subscribe_visibility(),
            network_rx: ctx.signals().subscribe_network(),
            activity_rx: ctx.signals().subscribe_activity(),
        };
        let task = runtime.spawn(worker.run(inputs));

        Ok(Self {
            state_tx,
            state_rx,
            cmd_tx,
            heartbeats,
            guard,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> PresenceState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PresenceState> {
        self.state_rx.clone()
    }

    /// Touch now (if publishing is allowed) and restart the interval.
    pub fn wake(&self) {
        let _ = self.cmd_tx.send(PresenceCmd::Wake);
    }

    /// The heartbeat channel coordinator, when a channel was configured.
    pub fn heartbeat_coordinator(&self) -> Option<&LifecycleCoordinator> {
        self.heartbeats.as_deref()
    }

    /// Unmount: clear the interval and watchdog, cancel the in-flight
    /// publish, close the heartbeat channel. Idempotent.
    pub fn close(&self) {
        {
            let closed = self.guard.lock();
            if closed.get() {
                return;
            }
            closed.set(true);
            self.state_tx
                .send_modify(|state| *state = PresenceState::Closed);
        }
        // Aborting the worker drops its in-flight publish handle, which
        // aborts that task too.
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.close();
        }
    }
}

impl Drop for PresencePublisher {
    fn drop(&mut self) {
        self.close();
    }
}

struct PresenceInputs {
    cmd_rx: mpsc::UnboundedReceiver<PresenceCmd>,
    session_rx: watch::Receiver<SessionSnapshot>,
    visibility_rx: watch::Receiver<Visibility>,
    network_rx: watch::Receiver<NetworkState>,
    activity_rx: broadcast::Receiver<ActivityKind>,
}

/// Aborts the publish task when dropped.
struct InFlight(JoinHandle<()>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PresenceWorker {
    api: Arc<dyn PresenceApi>,
    policy: ReconnectPolicy,
    heartbeats: Option<std::sync::Weak<LifecycleCoordinator>>,
    state_tx: Arc<watch::Sender<PresenceState>>,
    guard: Arc<ReentrantMutex<Cell<bool>>>,
    interval: Duration,
    inactivity_timeout: Duration,
    identity: Option<UserIdentity>,
    visibility: Visibility,
    network: NetworkState,
    inactive: bool,
    next_touch: Option<Instant>,
    inactive_at: Instant,
    in_flight: Option<InFlight>,
}

impl PresenceWorker {
    async fn run(mut self, mut inputs: PresenceInputs) {
        self.identity = inputs.session_rx.borrow_and_update().identity().cloned();
        self.visibility = *inputs.visibility_rx.borrow_and_update();
        self.network = *inputs.network_rx.borrow_and_update();
        self.wake("mount");

        let mut session_open = true;
        let mut visibility_open = true;
        let mut network_open = true;
        let mut activity_open = true;

        loop {
            let tick = tokio::time::sleep_until(
                self.next_touch
                    .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
            );
            tokio::pin!(tick);
            let watchdog = tokio::time::sleep_until(self.inactive_at);
            tokio::pin!(watchdog);

            tokio::select! {
                biased;

                cmd = inputs.cmd_rx.recv() => match cmd {
                    Some(PresenceCmd::Wake) => self.wake("explicit wake"),
                    None => break,
                },

                changed = inputs.session_rx.changed(), if session_open => {
                    if changed.is_err() {
                        session_open = false;
                        continue;
                    }
                    let identity = inputs.session_rx.borrow_and_update().identity().cloned();
                    let same_user = identity.as_ref().map(|u| &u.user_id)
                        == self.identity.as_ref().map(|u| &u.user_id);
                    self.identity = identity;
                    if !same_user {
                        self.in_flight = None;
                        self.wake("identity changed");
                    }
                }

                changed = inputs.visibility_rx.changed(), if visibility_open => {
                    if changed.is_err() {
                        visibility_open = false;
                        continue;
                    }
                    self.visibility = *inputs.visibility_rx.borrow_and_update();
                    if self.visibility == Visibility::Visible {
                        // Returning to the page counts as input
                        self.inactive = false;
                    }
                    self.wake("visibility changed");
                }

                changed = inputs.network_rx.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    self.network = *inputs.network_rx.borrow_and_update();
                    self.wake("network changed");
                }

                activity = inputs.activity_rx.recv(), if activity_open => {
                    match activity {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.reset_watchdog();
                            if self.inactive {
                                self.inactive = false;
                                self.wake("input after inactivity");
                            }
                        },
                        Err(broadcast::error::RecvError::Closed) => activity_open = false,
                    }
                }

                _ = &mut tick, if self.next_touch.is_some() => {
                    self.touch();
                    self.next_touch = Some(Instant::now() + self.interval);
                }

                // Idle time only counts while publishing
                _ = &mut watchdog, if !self.inactive && self.next_touch.is_some() => {
                    log::debug!(
                        "[realtime-sync] no input for {:?}; presence paused",
                        self.inactivity_timeout
                    );
                    self.inactive = true;
                    self.wake("inactivity");
                }
            }
        }
    }

    fn reset_watchdog(&mut self) {
        self.inactive_at = Instant::now() + self.inactivity_timeout;
    }

    fn current_state(&self) -> PresenceState {
        if self.identity.is_none() {
            PresenceState::SignedOut
        } else if self.visibility == Visibility::Hidden {
            PresenceState::PausedHidden
        } else if self.network == NetworkState::Offline {
            PresenceState::PausedOffline
        } else if self.inactive {
            PresenceState::PausedInactive
        } else {
            PresenceState::Publishing
        }
    }

    /// Re-evaluate after a signal. Entering (or staying in) `Publishing`
    /// touches immediately and restarts the interval; anything else clears it.
    fn wake(&mut self, reason: &str) {
        let state = self.current_state();
        if state == PresenceState::Publishing && self.next_touch.is_none() {
            self.reset_watchdog();
        }
        {
            let closed = self.guard.lock();
            if closed.get() {
                return;
            }
            self.state_tx.send_if_modified(|current| {
                if *current == state {
                    return false;
                }
                *current = state;
                true
            });
        }

        if state == PresenceState::Publishing {
            log::debug!("[realtime-sync] presence touch ({})", reason);
            self.touch();
            self.next_touch = Some(Instant::now() + self.interval);
        } else {
            log::debug!("[realtime-sync] presence {:?} ({})", state, reason);
            self.next_touch = None;
        }
    }

    fn touch(&mut self) {
        let Some(user) = &self.identity else {
            return;
        };
        if self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| !in_flight.0.is_finished())
        {
            log::debug!("[realtime-sync] presence publish still in flight; skipping touch");
            return;
        }
        let task = tokio::spawn(publish_with_retry(
            self.api.clone(),
            user.user_id.clone(),
            self.policy.clone(),
            self.heartbeats.clone(),
        ));
        self.in_flight = Some(InFlight(task));
    }
}

/// One presence touch with bounded retries. Never surfaces an error.
pub(crate) async fn publish_with_retry(
    api: Arc<dyn PresenceApi>,
    user_id: String,
    policy: ReconnectPolicy,
    heartbeats: Option<std::sync::Weak<LifecycleCoordinator>>,
) {
    let mut attempt = 0u32;
    loop {
        match api.touch(&user_id).await {
            Ok(()) => break,
            Err(RealtimeError::Unauthenticated) => {
                log::debug!("[realtime-sync] presence touch unauthenticated; session not ready");
                return;
            },
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.next_delay(attempt);
                attempt += 1;
                log::warn!(
                    "[realtime-sync] presence touch failed: {}; retry {}/{} in {}ms",
                    e,
                    attempt,
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            },
            Err(e) => {
                log::warn!("[realtime-sync] presence touch dropped: {}", e);
                return;
            },
        }
    }

    let Some(coordinator) = heartbeats.and_then(|weak| weak.upgrade()) else {
        return;
    };
    let event = Event::Heartbeat {
        user_id,
        ts: chrono::Utc::now().timestamp_millis(),
    };
    if let Err(e) = coordinator.send(&event).await {
        log::debug!("[realtime-sync] heartbeat broadcast skipped: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedApi {
        calls: AtomicUsize,
        failure: fn() -> RealtimeError,
    }

    #[async_trait]
    impl PresenceApi for ScriptedApi {
        async fn touch(&self, _user_id: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.failure)())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_is_not_retried() {
        let api = Arc::new(ScriptedApi {
            calls: AtomicUsize::new(0),
            failure: || RealtimeError::Unauthenticated,
        });
        publish_with_retry(api.clone(), "u1".into(), ReconnectPolicy::publish(), None).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retry_three_times_then_drop() {
        let api = Arc::new(ScriptedApi {
            calls: AtomicUsize::new(0),
            failure: || RealtimeError::ServerError {
                status_code: 503,
                message: "unavailable".into(),
            },
        });
        publish_with_retry(api.clone(), "u1".into(), ReconnectPolicy::publish(), None).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_presence_spec() {
        let spec = presence_spec("presence:org-1");
        assert_eq!(spec.topic, "presence:org-1");
        assert_eq!(spec.filters, vec![FilterSpec::broadcast(HEARTBEAT)]);
    }
}
