//! Application readiness derived from the messaging client's connection
//! state.
//!
//! The client publishes a [`ConnectionState`] on a watch channel; the
//! listener spawned by [`Readiness::start_listening`] folds it into a
//! coarser [`ReadinessState`] that the rest of the process observes.

use std::fmt;

use lbros_zmq::ConnectionState;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// Every configured socket is up and its loop is running.
    Ready,
    /// Not ready, with the reason.
    NotReadyYet(String),
    /// The client gave up connecting. Does not recover without a restart.
    Failed(String),
    /// No connection state observed yet.
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReadinessState::Failed(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Failed(_) => "Failed",
            ReadinessState::Unknown => "Unknown",
        }
    }

    /// Empty for `Ready` and `Unknown`.
    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::NotReadyYet(reason) | ReadinessState::Failed(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::NotReadyYet(reason) | ReadinessState::Failed(reason) => {
                write!(f, "{}: {}", self.as_str(), reason)
            }
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

impl From<&ConnectionState> for ReadinessState {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ReadinessState::Ready,
            ConnectionState::Idle => ReadinessState::NotReadyYet("Idle".to_string()),
            ConnectionState::Connecting => ReadinessState::NotReadyYet("Connecting...".to_string()),
            ConnectionState::Reconnecting(secs) => {
                ReadinessState::NotReadyYet(format!("Reconnecting in {secs:.1} sec"))
            }
            ConnectionState::Failed(reason) => ReadinessState::Failed(reason.clone()),
        }
    }
}

async fn listen(
    mut connection_rx: watch::Receiver<ConnectionState>,
    state_tx: watch::Sender<ReadinessState>,
) {
    debug!("Launching connection state listener");

    let initial = ReadinessState::from(&*connection_rx.borrow_and_update());
    debug!("Initial readiness status: {}", initial);
    state_tx.send_replace(initial);

    while connection_rx.changed().await.is_ok() {
        let connection = connection_rx.borrow_and_update().clone();
        let readiness = ReadinessState::from(&connection);
        debug!("Transition: client {} -> readiness {}", connection, readiness);

        if state_tx.send(readiness).is_err() {
            warn!("No subscribers to readiness status");
            break;
        }
    }

    debug!("Connection state channel closed, listening stopped");
}

/// Shared readiness tracker.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
    state_rx: watch::Receiver<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Unknown);
        Self { state_tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// Follows `connection_rx` until its sender is dropped.
    pub fn start_listening(
        &self,
        connection_rx: watch::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        tokio::spawn(listen(connection_rx, self.state_tx.clone()))
    }

    pub fn set_state(&self, state: ReadinessState) {
        let old_state = self.state_tx.send_replace(state.clone());
        debug!(
            "The readiness status has changed: {} -> {}",
            old_state, state
        );
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
