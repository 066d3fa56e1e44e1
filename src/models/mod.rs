//! Data models for the realtime layer.
//!
//! Defines channel specs and filters, typed events, status snapshots and the
//! row shapes delivered by the change-feed consumers. Nothing here is
//! persisted.

pub mod change_op;
pub mod channel_info;
pub mod channel_state;
pub mod connection_status;
pub mod event;
pub mod filter_spec;
pub mod identity;
pub mod lifecycle_state;
pub mod quiet_hours;
pub mod reconnect_attempt;
pub mod rows;
pub mod transport_status;

pub use change_op::ChangeOp;
pub use channel_info::ChannelInfo;
pub use channel_state::ChannelState;
pub use connection_status::ConnectionStatus;
pub use event::{
    Event, EventKind, BROADCAST_EVENT, HEARTBEAT, ROW_CHANGE_EVENT, TYPING_START, TYPING_STOP,
};
pub use filter_spec::{ChannelSpec, FilterSpec};
pub use identity::UserIdentity;
pub use lifecycle_state::LifecycleState;
pub use quiet_hours::{QuietHoursSettings, QuietHoursStatus};
pub use reconnect_attempt::ReconnectAttempt;
pub use rows::{LiveRow, NotificationRow, ProjectRow};
pub use transport_status::TransportStatus;
