//! Session identity supplied by the host's auth provider.
//!
//! Coordinators hold a [`watch::Receiver`] of [`SessionSnapshot`] and only
//! subscribe or publish while [`SessionSnapshot::identity`] is `Some`.

use std::sync::Arc;
use tokio::sync::watch;

use crate::models::UserIdentity;

/// Point-in-time view of the auth collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user: Option<UserIdentity>,
    /// False while the provider is still restoring or refreshing the session
    pub ready: bool,
}

impl SessionSnapshot {
    /// The usable identity: present only when the session is ready.
    pub fn identity(&self) -> Option<&UserIdentity> {
        if self.ready {
            self.user.as_ref()
        } else {
            None
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity().map(|u| u.user_id.as_str())
    }
}

/// Reactive session holder shared by every consumer.
#[derive(Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("snapshot", &*self.tx.borrow())
            .finish()
    }
}

impl SessionContext {
    /// Empty, not-ready session.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Session that is already signed in and ready.
    pub fn signed_in(user: UserIdentity) -> Self {
        let session = Self::new();
        session.sign_in(user);
        session
    }

    /// Set the identity and mark the session ready.
    pub fn sign_in(&self, user: UserIdentity) {
        self.tx.send_if_modified(|snapshot| {
            let next = SessionSnapshot {
                user: Some(user),
                ready: true,
            };
            if *snapshot == next {
                return false;
            }
            *snapshot = next;
            true
        });
    }

    /// Mark the session as loading (token refresh in progress).
    pub fn mark_pending(&self) {
        self.set_ready(false);
    }

    pub fn mark_ready(&self) {
        self.set_ready(true);
    }

    fn set_ready(&self, ready: bool) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.ready == ready {
                return false;
            }
            snapshot.ready = ready;
            true
        });
    }

    /// Clear the identity. Coordinators tear down silently.
    pub fn sign_out(&self) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.user.is_none() {
                return false;
            }
            snapshot.user = None;
            true
        });
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn current_identity(&self) -> Option<UserIdentity> {
        self.tx.borrow().identity().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_ready() {
        let snapshot = SessionSnapshot {
            user: Some(UserIdentity::new("u1", "Ada")),
            ready: false,
        };
        assert!(snapshot.identity().is_none());

        let session = SessionContext::new();
        assert!(session.current_identity().is_none());
        session.sign_in(UserIdentity::new("u1", "Ada"));
        assert_eq!(session.snapshot().user_id(), Some("u1"));

        session.mark_pending();
        assert!(session.current_identity().is_none());
        session.mark_ready();
        assert!(session.current_identity().is_some());
    }

    #[tokio::test]
    async fn test_sign_out_notifies_subscribers() {
        let session = SessionContext::signed_in(UserIdentity::new("u1", "Ada"));
        let mut rx = session.subscribe();
        rx.borrow_and_update();

        session.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow().identity().is_none());

        // Second sign-out is not a change
        session.sign_out();
        assert!(!rx.has_changed().unwrap());
    }
}
