//! Connection state of a client instance.
//!
//! The state is published on a `tokio::sync::watch` channel so that the
//! application can react to transitions:
//!
//! ```text
//! Idle -> Connecting -> Connected
//!              |
//!              +-> Reconnecting(delay) -> Connecting -> ...
//!              |
//!              +-> Failed(reason)
//! ```
//!
//! # Examples
//!
//! ```ignore
//! let mut rx = client.state();
//! while rx.changed().await.is_ok() {
//!     println!("client is {}", *rx.borrow());
//! }
//! ```

use std::fmt;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not started, or stopped.
    Idle,

    /// Setting up the configured sockets.
    Connecting,

    /// All configured sockets are bound or connected and loops are running.
    Connected,

    /// Waiting the given number of seconds before the next attempt.
    Reconnecting(f64),

    /// The reconnection policy gave up; the string is the reason.
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Failed(_) => "Failed",
        }
    }

    /// Reason for `Failed`, delay for `Reconnecting`, empty otherwise.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Failed(reason) => reason.clone(),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Owner side of the state channel. Receivers are only woken on change.
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    /// Publishes `state`; returns false when it equals the current state.
    pub fn set(&self, state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!(from = %current, to = %state, "Connection state changed");
            *current = state;
            true
        })
    }

    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
