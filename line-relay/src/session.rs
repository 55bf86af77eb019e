//! Lifecycle and counters of one client session.
//!
//! ```text
//! Connecting -> Active -> Draining -> Closed
//!                  \          |
//!                   +-> Faulted -> Closed
//! ```

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    /// Inbound side closed; queued messages are still being forwarded.
    Draining,
    /// A fatal error ended the session.
    Faulted,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active | Faulted | Closed)
                | (Active, Draining | Faulted | Closed)
                | (Draining, Faulted | Closed)
                | (Faulted, Closed)
        )
    }
}

/// Shared view of a session, handed to every task working for it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

struct SessionShared {
    index: usize,
    state: watch::Sender<SessionState>,
    forwarded: AtomicU64,
    acknowledged: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl SessionHandle {
    pub fn new(index: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            inner: Arc::new(SessionShared {
                index,
                state,
                forwarded: AtomicU64::new(0),
                acknowledged: AtomicU64::new(0),
                fault: Mutex::new(None),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Moves to `next` if the lifecycle allows it. Returns whether the state
    /// changed.
    pub fn transition(&self, next: SessionState) -> bool {
        let session = self.inner.index;
        self.inner.state.send_if_modified(|current| {
            if !current.can_become(next) {
                return false;
            }
            let from = *current;
            info!(session, ?from, to = ?next, "session state changed");
            *current = next;
            true
        })
    }

    /// Records the first fatal error and moves to `Faulted`.
    pub fn fault(&self, reason: impl fmt::Display) {
        let reason = reason.to_string();
        error!(session = self.inner.index, error = %reason, "session faulted");
        self.inner
            .fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_or_insert(reason);
        self.transition(SessionState::Faulted);
    }

    pub fn record_forwarded(&self) {
        self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.inner.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            index: self.inner.index,
            state: self.state(),
            fault: self
                .inner
                .fault
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            forwarded: self.inner.forwarded.load(Ordering::Relaxed),
            acknowledged: self.inner.acknowledged.load(Ordering::Relaxed),
        }
    }
}

/// Final account of one client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub index: usize,
    pub state: SessionState,
    pub fault: Option<String>,
    /// Messages handed to the server.
    pub forwarded: u64,
    /// Acknowledgments or replies written back to the client.
    pub acknowledged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_drain_path() {
        let session = SessionHandle::new(0);
        assert!(session.transition(SessionState::Active));
        assert!(session.transition(SessionState::Draining));
        assert!(!session.transition(SessionState::Active));
        assert!(session.transition(SessionState::Closed));
        assert!(session.state().is_terminal());
        assert!(!session.transition(SessionState::Faulted));
    }

    #[test]
    fn keeps_the_first_fault() {
        let session = SessionHandle::new(3);
        session.transition(SessionState::Active);
        session.fault("queue is full");
        session.fault("second failure");
        session.transition(SessionState::Closed);

        let report = session.report();
        assert_eq!(report.index, 3);
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.fault.as_deref(), Some("queue is full"));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let session = SessionHandle::new(1);
        let mut states = session.subscribe();
        session.transition(SessionState::Active);

        states.changed().await.expect("state changed");
        assert_eq!(*states.borrow(), SessionState::Active);
    }
}
