//! Error handling for the messaging client.
//!
//! `TransferError` is the single error type returned by every fallible
//! operation in this crate. Variants are grouped by how the caller is
//! expected to react:
//!
//! **Configuration errors** (reported synchronously, never retried):
//! - `UnknownSocket`, `UnknownPattern`, `UnsupportedPattern`, `WrongPattern`
//! - `UnknownTopic`, `UnknownParam`, `InvalidParam`, `ConfigError`
//!
//! **Transient I/O errors** (logged, the operation returns a failure and
//! loops carry on with the next tick):
//! - `Socket`, `WebSocket`, `Timeout`, `Io`, `Task`
//!
//! **Protocol and framing errors** (the message is dropped):
//! - `MalformedFrame`, `Serialization`, `Deserialization`, `Bridge`
//!
//! **Lifecycle errors** (bind/connect during explicit setup, start/stop):
//! - `Bind`, `Connect`, `SocketClosed`, `NotRunning`, `RetriesPolicy`
//!
//! # Usage
//!
//! ```ignore
//! match client.send_message("pub_server", &payload) {
//!     Ok(()) => {}
//!     Err(TransferError::UnknownSocket(name)) => eprintln!("no socket named {name}"),
//!     Err(e) => eprintln!("send failed, will retry next tick: {e}"),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffError;

/// The unified error type for messaging operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No socket is registered under the given name.
    #[error("Unknown socket: {0}")]
    UnknownSocket(String),

    /// No configured pattern has the given name.
    #[error("Unknown pattern: {0}")]
    UnknownPattern(String),

    /// The requested socket type string does not name a supported pattern.
    ///
    /// Supported patterns are `req`, `rep`, `pub`, `sub`, `push` and `pull`.
    #[error("Unsupported socket pattern: {0}")]
    UnsupportedPattern(String),

    /// An operation was attempted on a socket whose pattern does not allow it,
    /// for example `request_reply` on a PUB socket.
    #[error("Socket '{name}' is {actual}, operation requires {expected}")]
    WrongPattern {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// No publish topic is registered under the given key.
    #[error("Unknown publish topic: {0}")]
    UnknownTopic(String),

    /// The parameter store has no such key in the given section.
    #[error("Unknown parameter: {section}.{key}")]
    UnknownParam { section: String, key: String },

    /// A parameter value has the wrong type or the section name is unknown.
    #[error("Invalid parameter {section}.{key}: {reason}")]
    InvalidParam {
        section: String,
        key: String,
        reason: String,
    },

    /// Configuration validation failed.
    ///
    /// Raised when a section is loaded or updated with values outside
    /// the ranges declared on the parameter structs.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// A payload could not be encoded in the configured message format.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Received bytes could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A multi-frame message does not follow the bridge frame layout.
    ///
    /// Most commonly the length frame disagrees with the payload frame.
    /// Loops drop such messages and continue.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The underlying transport library reported an error.
    #[error("Socket error: {0}")]
    Socket(#[from] zmq::Error),

    /// The websocket transport to the topic bridge failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The topic bridge answered a request with a failure.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Binding a server-role socket failed (address in use, bad endpoint).
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },

    /// Connecting a client-role socket failed (malformed endpoint).
    #[error("Failed to connect {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },

    /// A bounded operation ran past its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The handle outlived its socket: it was closed or replaced by a new
    /// socket of the same name.
    #[error("Socket '{0}' is closed")]
    SocketClosed(String),

    /// The client has not been started or has already been stopped.
    #[error("Client is not running")]
    NotRunning,

    /// The reconnection policy gave up.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] BackoffError),

    /// Local I/O error (connectivity probe, file access).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(String),
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() || err.is_data() {
            TransferError::Serialization(err.to_string())
        } else {
            TransferError::Deserialization(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Task(err.to_string())
    }
}

impl TransferError {
    /// Returns true for errors that a loop should log and survive.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Socket(_)
                | TransferError::WebSocket(_)
                | TransferError::Timeout(_)
                | TransferError::Io(_)
                | TransferError::MalformedFrame(_)
                | TransferError::Serialization(_)
                | TransferError::Deserialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_socket_display() {
        let err = TransferError::UnknownSocket("pub_server".into());
        assert_eq!(err.to_string(), "Unknown socket: pub_server");
    }

    #[test]
    fn test_wrong_pattern_display() {
        let err = TransferError::WrongPattern {
            name: "pub_server".into(),
            expected: "REQ",
            actual: "PUB",
        };
        assert_eq!(
            err.to_string(),
            "Socket 'pub_server' is PUB, operation requires REQ"
        );
    }

    #[test]
    fn test_bind_error_keeps_source() {
        let err = TransferError::Bind {
            endpoint: "tcp://*:5556".into(),
            source: zmq::Error::EADDRINUSE,
        };
        assert!(err.to_string().starts_with("Failed to bind tcp://*:5556"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TransferError = io_err.into();
        assert!(err.to_string().contains("refused"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_configuration_errors_are_not_transient() {
        assert!(!TransferError::UnknownTopic("odom".into()).is_transient());
        assert!(!TransferError::NotRunning.is_transient());
        assert!(!TransferError::SocketClosed("pull_server".into()).is_transient());
        assert!(TransferError::MalformedFrame("short".into()).is_transient());
    }

    #[test]
    fn test_websocket_errors_are_transient() {
        let err: TransferError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(err.is_transient());
        assert!(!TransferError::Bridge("service failed".into()).is_transient());
    }

    #[test]
    fn test_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(TransferError::Timeout(
            Duration::from_secs(1),
        ));
        assert_eq!(err.to_string(), "Operation timed out after 1s");
    }
}
