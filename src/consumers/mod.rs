//! Typed consumers built on the lifecycle coordinator.
//!
//! - [`change_feed`]: row mutations mapped to typed rows
//! - [`typing`]: typing indicators over broadcast
//! - [`presence`]: periodic presence touches with an inactivity watchdog
//! - [`quiet_hours`]: notification interruption gate

pub mod change_feed;
pub mod presence;
pub mod quiet_hours;
pub mod typing;

pub use change_feed::{ChangeFeedConsumer, ChangeFeedOptions, LiveRows};
pub use presence::{PresenceOptions, PresencePublisher, PresenceState};
pub use quiet_hours::{QuietHoursGate, QuietHoursWindow};
pub use typing::{TypingConsumer, TypingParticipant, TypingRoster};
