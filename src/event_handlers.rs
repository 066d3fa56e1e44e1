//! Lifecycle event handlers for coordinators.
//!
//! Provides callback-based hooks for observing a coordinator's connection:
//!
//! - [`on_state`](LifecycleHandlers::on_state): every coordinator state transition
//! - [`on_connect`](LifecycleHandlers::on_connect): the channel became `Active`
//! - [`on_reconnect_scheduled`](LifecycleHandlers::on_reconnect_scheduled): a retry was armed
//! - [`on_degraded`](LifecycleHandlers::on_degraded): retries exhausted (fired once per degradation)
//! - [`on_error`](LifecycleHandlers::on_error): a channel failure, recoverable or not
//!
//! All handlers run on the owning coordinator's task, one at a time.
//!
//! # Example
//!
//! ```rust
//! use realtime_sync::LifecycleHandlers;
//!
//! let handlers = LifecycleHandlers::new()
//!     .on_connect(|| println!("live"))
//!     .on_degraded(|status| eprintln!("realtime off: {:?}", status.error));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::models::{ConnectionStatus, LifecycleState, ReconnectAttempt};

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable error message.
    pub message: String,
    /// Whether the coordinator will retry automatically.
    pub recoverable: bool,
}

impl ConnectionError {
    /// Create a new connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Type alias for the on_state callback.
pub type OnStateCallback = Arc<dyn Fn(LifecycleState) + Send + Sync>;

/// Type alias for the on_connect callback.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the on_reconnect_scheduled callback.
pub type OnReconnectCallback = Arc<dyn Fn(ReconnectAttempt) + Send + Sync>;

/// Type alias for the on_degraded callback.
pub type OnDegradedCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Type alias for the on_error callback.
pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// Coordinator lifecycle handlers. All optional.
#[derive(Clone, Default)]
pub struct LifecycleHandlers {
    pub(crate) on_state: Option<OnStateCallback>,
    pub(crate) on_connect: Option<OnConnectCallback>,
    pub(crate) on_reconnect_scheduled: Option<OnReconnectCallback>,
    pub(crate) on_degraded: Option<OnDegradedCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
}

impl fmt::Debug for LifecycleHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHandlers")
            .field("on_state", &self.on_state.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_reconnect_scheduled", &self.on_reconnect_scheduled.is_some())
            .field("on_degraded", &self.on_degraded.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl LifecycleHandlers {
    /// Create a new empty `LifecycleHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every coordinator state transition.
    pub fn on_state(mut self, f: impl Fn(LifecycleState) + Send + Sync + 'static) -> Self {
        self.on_state = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the channel becomes `Active`.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked whenever a retry is scheduled.
    pub fn on_reconnect_scheduled(
        mut self,
        f: impl Fn(ReconnectAttempt) + Send + Sync + 'static,
    ) -> Self {
        self.on_reconnect_scheduled = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked once when retries are exhausted.
    ///
    /// Routine reconnects never reach this handler; it is the single
    /// user-visible signal worth rendering (e.g. a small "offline" badge).
    pub fn on_degraded(mut self, f: impl Fn(ConnectionStatus) + Send + Sync + 'static) -> Self {
        self.on_degraded = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every channel failure.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_state.is_some()
            || self.on_connect.is_some()
            || self.on_reconnect_scheduled.is_some()
            || self.on_degraded.is_some()
            || self.on_error.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_state(&self, state: LifecycleState) {
        if let Some(cb) = &self.on_state {
            cb(state);
        }
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_reconnect_scheduled(&self, attempt: ReconnectAttempt) {
        if let Some(cb) = &self.on_reconnect_scheduled {
            cb(attempt);
        }
    }

    pub(crate) fn emit_degraded(&self, status: ConnectionStatus) {
        if let Some(cb) = &self.on_degraded {
            cb(status);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }
}
