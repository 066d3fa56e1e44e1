//! # realtime-sync
//!
//! Resilient realtime subscriptions for UI-facing applications: row change
//! feeds, typing indicators, presence heartbeats and a quiet-hours gate, all
//! multiplexed over one shared transport connection.
//!
//! Each consumer owns a [`LifecycleCoordinator`] that subscribes once a ready
//! identity exists, retries failures with exponential backoff and jitter,
//! degrades after a bounded number of attempts, and resubscribes immediately
//! when the page becomes visible or the network comes back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use realtime_sync::{ChangeFeedConsumer, RealtimeConfig, RealtimeContext, UserIdentity};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = RealtimeConfig::from_file("realtime.toml")?;
//! config.apply_env_overrides();
//! config.finalize()?;
//!
//! let ctx = RealtimeContext::from_config(&config)?;
//! ctx.session().sign_in(UserIdentity::new("u1", "Ada"));
//!
//! let _feed = ChangeFeedConsumer::notifications(&ctx, |row| {
//!     println!("new notification: {}", row.title);
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod consumers;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod event_handlers;
pub mod http;
pub mod logging;
pub mod models;
pub mod reconnect;
pub mod session;
pub mod signals;
pub mod timeouts;
pub mod transport;

pub use auth::{CredentialSource, Credentials, DynamicCredentials};
pub use channel::{ChannelHandle, ChannelRegistry, ConsumerId, OnEvent, OnStatus, StatusUpdate};
pub use config::{HttpSettings, LoggingSettings, RealtimeConfig, TransportSettings};
pub use consumers::{
    ChangeFeedConsumer, ChangeFeedOptions, LiveRows, PresenceOptions, PresencePublisher,
    PresenceState, QuietHoursGate, QuietHoursWindow, TypingConsumer, TypingParticipant,
    TypingRoster,
};
pub use context::{RealtimeContext, RealtimeContextBuilder};
pub use coordinator::{CoordinatorConfig, HideBehavior, LifecycleCoordinator};
pub use error::{RealtimeError, Result};
pub use event_handlers::{ConnectionError, LifecycleHandlers};
pub use http::{HttpApiClient, PresenceApi, QuietHoursApi};
pub use models::{
    ChangeOp, ChannelInfo, ChannelSpec, ChannelState, ConnectionStatus, Event, EventKind,
    FilterSpec, LifecycleState, LiveRow, NotificationRow, ProjectRow, QuietHoursSettings,
    QuietHoursStatus, ReconnectAttempt, TransportStatus, UserIdentity,
};
pub use reconnect::{ReconnectPolicies, ReconnectPolicy};
pub use session::{SessionContext, SessionSnapshot};
pub use signals::{ActivityKind, LifecycleSignals, NetworkState, Visibility};
pub use timeouts::RealtimeTimeouts;
pub use transport::{MemoryTransport, RealtimeTransport, TransportChannel, WebSocketTransport};
