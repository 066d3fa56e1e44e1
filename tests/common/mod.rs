#![allow(dead_code)]
//! Shared helpers for the integration suites.
//!
//! Suites drive consumers against `MemoryTransport` on a paused Tokio clock
//! (`#[tokio::test(start_paused = true)]`), so backoff, sweep and heartbeat
//! timers are deterministic.

use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_sync::{
    MemoryTransport, PresenceApi, QuietHoursApi, QuietHoursSettings, RealtimeContext,
    RealtimeError, RealtimeTimeouts, Result, SessionContext, UserIdentity,
};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const USER_ID: &str = "u1";
pub const USER_NAME: &str = "Ada";

pub fn user() -> UserIdentity {
    UserIdentity::new(USER_ID, USER_NAME)
}

/// Context over `transport` with a signed-in, ready user.
pub fn signed_in_ctx(transport: &MemoryTransport) -> RealtimeContext {
    RealtimeContext::builder(Arc::new(transport.clone()))
        .session(SessionContext::signed_in(user()))
        .timeouts(RealtimeTimeouts::for_testing())
        .build()
}

/// Context over `transport` with nobody signed in.
pub fn anonymous_ctx(transport: &MemoryTransport) -> RealtimeContext {
    RealtimeContext::builder(Arc::new(transport.clone()))
        .timeouts(RealtimeTimeouts::for_testing())
        .build()
}

/// Let every ready task run (pumps, coordinators, workers).
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock by `duration`, letting tasks run on the way.
pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

pub fn row(pairs: &[(&str, JsonValue)]) -> Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub fn notification_row(id: &str, title: &str) -> Map<String, JsonValue> {
    row(&[
        ("id", json!(id)),
        ("user_id", json!(USER_ID)),
        ("title", json!(title)),
        ("is_read", json!(false)),
    ])
}

/// Collects values passed to a callback.
#[derive(Clone)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn last(&self) -> Option<T> {
        self.items.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Presence endpoint that records call times and replays scripted results.
/// Succeeds once the script is exhausted.
pub struct MockPresenceApi {
    calls: Mutex<Vec<(String, Instant)>>,
    script: Mutex<VecDeque<Result<()>>>,
}

impl MockPresenceApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push_result(&self, result: Result<()>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn users(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(user, _)| user.clone()).collect()
    }
}

#[async_trait]
impl PresenceApi for MockPresenceApi {
    async fn touch(&self, user_id: &str) -> Result<()> {
        self.calls.lock().push((user_id.to_string(), Instant::now()));
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// Quiet-hours endpoints with fixed answers.
pub struct MockQuietHoursApi {
    pub settings: Mutex<QuietHoursSettings>,
    pub server_verdict: Mutex<Option<bool>>,
}

impl MockQuietHoursApi {
    pub fn new(start: &str, end: &str, days: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(QuietHoursSettings {
                enabled: true,
                start_time: start.to_string(),
                end_time: end.to_string(),
                days: days.iter().map(|day| day.to_string()).collect(),
            }),
            server_verdict: Mutex::new(Some(false)),
        })
    }
}

#[async_trait]
impl QuietHoursApi for MockQuietHoursApi {
    async fn fetch_settings(&self) -> Result<QuietHoursSettings> {
        Ok(self.settings.lock().clone())
    }

    async fn is_quiet_now(&self) -> Result<bool> {
        match *self.server_verdict.lock() {
            Some(quiet) => Ok(quiet),
            None => Err(RealtimeError::NetworkError("connection refused".into())),
        }
    }
}
