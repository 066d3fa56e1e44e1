//! Typing indicators over an ephemeral broadcast channel.
//!
//! Outbound: [`TypingConsumer::on_typing_input`] sends `typing_start` once
//! and arms an auto-stop timer; further input only re-arms it.
//! [`TypingConsumer::stop_typing`] sends `typing_stop` immediately.
//!
//! Inbound: `typing_start` upserts a participant, `typing_stop` removes it,
//! and a periodic sweep drops anyone whose last signal is older than the TTL.
//! The sweep is what clears indicators when a `stop` is lost.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::OnEvent;
use crate::context::RealtimeContext;
use crate::coordinator::{CoordinatorConfig, HideBehavior, LifecycleCoordinator};
use crate::error::{RealtimeError, Result};
use crate::event_handlers::LifecycleHandlers;
use crate::models::{ChannelSpec, ConnectionStatus, Event, FilterSpec, TYPING_START, TYPING_STOP};
use crate::session::SessionContext;
use crate::transport::FAR_FUTURE;

/// Someone currently typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingParticipant {
    pub user_id: String,
    pub display_name: String,
    pub last_signal_at: Instant,
}

/// Participants of one conversation with a fixed time-to-live.
///
/// A participant is present for `now < last_signal_at + ttl` and absent from
/// `last_signal_at + ttl` on, whether or not [`sweep`](Self::sweep) has run.
#[derive(Debug, Clone)]
pub struct TypingRoster {
    ttl: Duration,
    participants: BTreeMap<String, TypingParticipant>,
}

impl TypingRoster {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            participants: BTreeMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn alive(&self, participant: &TypingParticipant, now: Instant) -> bool {
        now < participant.last_signal_at + self.ttl
    }

    /// Record a `start` signal.
    pub fn upsert(&mut self, user_id: &str, display_name: &str, now: Instant) {
        self.participants.insert(
            user_id.to_string(),
            TypingParticipant {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                last_signal_at: now,
            },
        );
    }

    /// Record a `stop` signal. Returns true when the user was listed.
    pub fn remove(&mut self, user_id: &str) -> bool {
        self.participants.remove(user_id).is_some()
    }

    /// Drop expired participants. Returns true when any were removed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let ttl = self.ttl;
        let before = self.participants.len();
        self.participants
            .retain(|_, participant| now < participant.last_signal_at + ttl);
        self.participants.len() != before
    }

    pub fn is_present(&self, user_id: &str, now: Instant) -> bool {
        self.participants
            .get(user_id)
            .is_some_and(|participant| self.alive(participant, now))
    }

    /// Live participants ordered by user id.
    pub fn active(&self, now: Instant) -> Vec<&TypingParticipant> {
        self.participants
            .values()
            .filter(|participant| self.alive(participant, now))
            .collect()
    }

    /// Display names of live participants.
    pub fn names(&self, now: Instant) -> Vec<String> {
        self.active(now)
            .into_iter()
            .map(|participant| participant.display_name.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Channel spec for a conversation's typing broadcasts.
pub fn typing_spec(conversation_id: &str) -> ChannelSpec {
    ChannelSpec::new(
        format!("typing:{}", conversation_id),
        vec![
            FilterSpec::broadcast(TYPING_START),
            FilterSpec::broadcast(TYPING_STOP),
        ],
    )
}

enum TypingCmd {
    Input,
    Stop,
}

/// Closed flag shared with the worker; held while `on_typing` runs.
type CloseGuard = Arc<ReentrantMutex<Cell<bool>>>;

/// Typing indicator for one conversation.
///
/// Dropping the consumer unmounts it.
pub struct TypingConsumer {
    conversation_id: String,
    coordinator: Arc<LifecycleCoordinator>,
    roster: Arc<Mutex<TypingRoster>>,
    cmd_tx: mpsc::UnboundedSender<TypingCmd>,
    guard: CloseGuard,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TypingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypingConsumer")
            .field("conversation_id", &self.conversation_id)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl TypingConsumer {
    /// Subscribe to `conversation_id` and report the visible names through
    /// `on_typing` whenever the set changes.
    pub fn mount(
        ctx: &RealtimeContext,
        conversation_id: impl Into<String>,
        on_typing: impl Fn(Vec<String>) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::mount_with(ctx, conversation_id, LifecycleHandlers::default(), on_typing)
    }

    pub fn mount_with(
        ctx: &RealtimeContext,
        conversation_id: impl Into<String>,
        handlers: LifecycleHandlers,
        on_typing: impl Fn(Vec<String>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::ConfigurationError(
                "TypingConsumer must be mounted inside a Tokio runtime".to_string(),
            )
        })?;
        let conversation_id = conversation_id.into();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let on_event: OnEvent = Arc::new(move |event| {
            let _ = events_tx.send(event);
        });

        let spec_conversation = conversation_id.clone();
        let config = CoordinatorConfig::new(format!("typing:{}", conversation_id), move |_| {
            typing_spec(&spec_conversation)
        })
        .with_policy(ctx.policies().ephemeral.clone())
        .with_hide_behavior(HideBehavior::TearDown)
        .with_handlers(handlers);
        let coordinator = Arc::new(LifecycleCoordinator::mount(ctx, config, on_event)?);

        let timeouts = ctx.timeouts();
        let roster = Arc::new(Mutex::new(TypingRoster::new(timeouts.typing_ttl)));
        let guard: CloseGuard = Arc::new(ReentrantMutex::new(Cell::new(false)));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let worker = TypingWorker {
            conversation_id: conversation_id.clone(),
            session: ctx.session().clone(),
            coordinator: Arc::downgrade(&coordinator),
            roster: roster.clone(),
            guard: guard.clone(),
            on_typing: Box::new(on_typing),
            sweep_interval: timeouts.typing_sweep_interval,
            idle_stop: timeouts.typing_idle_stop,
            visible: Vec::new(),
            signaling: false,
            stop_at: None,
        };
        let task = runtime.spawn(worker.run(events_rx, cmd_rx));

        Ok(Self {
            conversation_id,
            coordinator,
            roster,
            cmd_tx,
            guard,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Call on every keystroke.
    pub fn on_typing_input(&self) {
        let _ = self.cmd_tx.send(TypingCmd::Input);
    }

    /// Call when the message is sent or the input is cleared.
    pub fn stop_typing(&self) {
        let _ = self.cmd_tx.send(TypingCmd::Stop);
    }

    /// Names of everyone currently typing (never includes the local user).
    pub fn typing_names(&self) -> Vec<String> {
        self.roster.lock().names(Instant::now())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.coordinator.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.coordinator.subscribe_status()
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    /// Unmount: stop the timers, close the channel. Idempotent.
    pub fn close(&self) {
        {
            let closed = self.guard.lock();
            if closed.get() {
                return;
            }
            closed.set(true);
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.coordinator.close();
        self.roster.lock().clear();
    }
}

impl Drop for TypingConsumer {
    fn drop(&mut self) {
        self.close();
    }
}

struct TypingWorker {
    conversation_id: String,
    session: SessionContext,
    coordinator: Weak<LifecycleCoordinator>,
    roster: Arc<Mutex<TypingRoster>>,
    guard: CloseGuard,
    on_typing: Box<dyn Fn(Vec<String>) + Send + Sync>,
    sweep_interval: Duration,
    idle_stop: Duration,
    /// Names last reported through `on_typing`
    visible: Vec<String>,
    signaling: bool,
    stop_at: Option<Instant>,
}

impl TypingWorker {
    async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
        mut cmd_rx: mpsc::UnboundedReceiver<TypingCmd>,
    ) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let auto_stop =
                tokio::time::sleep_until(self.stop_at.unwrap_or_else(|| Instant::now() + FAR_FUTURE));
            tokio::pin!(auto_stop);

            tokio::select! {
                biased;

                Some(event) = events_rx.recv() => self.on_event(event),

                cmd = cmd_rx.recv() => match cmd {
                    Some(TypingCmd::Input) => self.on_input().await,
                    Some(TypingCmd::Stop) => self.send_stop().await,
                    None => break,
                },

                _ = &mut auto_stop, if self.stop_at.is_some() => {
                    log::debug!(
                        "[realtime-sync] typing idle in '{}'; sending stop",
                        self.conversation_id
                    );
                    self.send_stop().await;
                }

                _ = sweep.tick() => {
                    let now = Instant::now();
                    let removed = self.roster.lock().sweep(now);
                    if removed {
                        log::debug!(
                            "[realtime-sync] typing sweep expired participants in '{}'",
                            self.conversation_id
                        );
                    }
                    self.report(now);
                }
            }
        }
    }

    fn own_user_id(&self) -> Option<String> {
        self.session.current_identity().map(|user| user.user_id)
    }

    fn on_event(&mut self, event: Event) {
        if event.sender_id().is_some() && event.sender_id() == self.own_user_id().as_deref() {
            return;
        }
        let now = Instant::now();
        match event {
            Event::TypingStart {
                conversation_id,
                user_id,
                user_name,
            } if conversation_id == self.conversation_id => {
                self.roster.lock().upsert(&user_id, &user_name, now);
            },
            Event::TypingStop {
                conversation_id,
                user_id,
            } if conversation_id == self.conversation_id => {
                self.roster.lock().remove(&user_id);
            },
            _ => return,
        }
        self.report(now);
    }

    /// Invoke `on_typing` when the visible names changed.
    fn report(&mut self, now: Instant) {
        let names = self.roster.lock().names(now);
        if names == self.visible {
            return;
        }
        self.visible = names.clone();

        let closed = self.guard.lock();
        if closed.get() {
            return;
        }
        (self.on_typing)(names);
    }

    async fn on_input(&mut self) {
        self.stop_at = Some(Instant::now() + self.idle_stop);
        if self.signaling {
            return;
        }
        let Some(user) = self.session.current_identity() else {
            return;
        };
        self.signaling = true;
        self.send(Event::TypingStart {
            conversation_id: self.conversation_id.clone(),
            user_id: user.user_id,
            user_name: user.display_name,
        })
        .await;
    }

    async fn send_stop(&mut self) {
        self.stop_at = None;
        if !self.signaling {
            return;
        }
        self.signaling = false;
        let Some(user_id) = self.own_user_id() else {
            return;
        };
        self.send(Event::TypingStop {
            conversation_id: self.conversation_id.clone(),
            user_id,
        })
        .await;
    }

    async fn send(&self, event: Event) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        if let Err(e) = coordinator.send(&event).await {
            log::debug!(
                "[realtime-sync] typing {} not sent in '{}': {}",
                event.kind(),
                self.conversation_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_expires_exactly_at_ttl() {
        let t0 = Instant::now();
        let mut roster = TypingRoster::new(Duration::from_secs(3));
        roster.upsert("u2", "Sam", t0);

        assert!(roster.is_present("u2", t0));
        assert!(roster.is_present("u2", t0 + Duration::from_millis(2999)));
        assert!(!roster.is_present("u2", t0 + Duration::from_millis(3000)));
        assert!(roster.names(t0 + Duration::from_secs(4)).is_empty());

        assert!(!roster.sweep(t0 + Duration::from_millis(2999)));
        assert!(roster.sweep(t0 + Duration::from_millis(3000)));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_upsert_refreshes_signal() {
        let t0 = Instant::now();
        let mut roster = TypingRoster::new(Duration::from_secs(3));
        roster.upsert("u2", "Sam", t0);
        roster.upsert("u2", "Sam", t0 + Duration::from_secs(2));

        assert!(roster.is_present("u2", t0 + Duration::from_millis(4999)));
        assert!(!roster.is_present("u2", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_names_ordered_and_stop_removes() {
        let now = Instant::now();
        let mut roster = TypingRoster::new(Duration::from_secs(3));
        roster.upsert("u3", "Kim", now);
        roster.upsert("u2", "Sam", now);
        assert_eq!(roster.names(now), vec!["Sam".to_string(), "Kim".to_string()]);

        assert!(roster.remove("u2"));
        assert!(!roster.remove("u2"));
        assert_eq!(roster.names(now), vec!["Kim".to_string()]);
    }

    #[test]
    fn test_typing_spec() {
        let spec = typing_spec("c1");
        assert_eq!(spec.topic, "typing:c1");
        assert!(spec.has_broadcast());
        assert!(!spec.receive_own_broadcasts);
    }
}
