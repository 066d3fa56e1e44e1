//! External lifecycle signals: page visibility, network reachability and
//! user input activity.
//!
//! The host feeds these from whatever it runs on (a webview bridge, OS
//! notifications, a terminal). Coordinators hold receivers as their
//! listeners and drop them at teardown.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Capacity of the input-activity fan-out. Lagging receivers only lose
/// redundant "still active" pings.
const ACTIVITY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Online,
    Offline,
}

/// User input observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Pointer,
    Keyboard,
    Scroll,
    Touch,
}

/// Shared signal hub. Cloning shares the same underlying channels.
#[derive(Clone)]
pub struct LifecycleSignals {
    visibility: Arc<watch::Sender<Visibility>>,
    network: Arc<watch::Sender<NetworkState>>,
    activity: broadcast::Sender<ActivityKind>,
}

impl Default for LifecycleSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleSignals")
            .field("visibility", &self.visibility())
            .field("network", &self.network())
            .finish()
    }
}

impl LifecycleSignals {
    /// Visible and online.
    pub fn new() -> Self {
        let (visibility, _) = watch::channel(Visibility::Visible);
        let (network, _) = watch::channel(NetworkState::Online);
        let (activity, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        Self {
            visibility: Arc::new(visibility),
            network: Arc::new(network),
            activity,
        }
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        log::debug!("[realtime-sync] visibility -> {:?}", visibility);
        self.visibility.send_if_modified(|current| {
            if *current == visibility {
                return false;
            }
            *current = visibility;
            true
        });
    }

    pub fn set_network(&self, state: NetworkState) {
        log::debug!("[realtime-sync] network -> {:?}", state);
        self.network.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Report an input event. No-op when nobody listens.
    pub fn record_activity(&self, kind: ActivityKind) {
        let _ = self.activity.send(kind);
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    pub fn network(&self) -> NetworkState {
        *self.network.borrow()
    }

    pub fn subscribe_visibility(&self) -> watch::Receiver<Visibility> {
        self.visibility.subscribe()
    }

    pub fn subscribe_network(&self) -> watch::Receiver<NetworkState> {
        self.network.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityKind> {
        self.activity.subscribe()
    }
}
