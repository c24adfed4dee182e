//! Socket patterns, tuning and the per-socket handle.
//!
//! A [`SocketHandle`] wraps one `zmq::Socket` behind a mutex. The lock is
//! only held for the duration of a single library call; every receive used
//! by the pattern loops is non-blocking (`DONTWAIT`), and blocking receives
//! are bounded by the handle's receive timeout.
//!
//! Closing a handle drops the socket right away, even while loops or callers
//! still hold clones of the handle. Those clones then fail every operation
//! with `SocketClosed`.

use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{error::TransferError, Result};

/// Communication role of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketPattern {
    Request,
    Reply,
    Publish,
    Subscribe,
    Push,
    Pull,
}

impl SocketPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketPattern::Request => "REQ",
            SocketPattern::Reply => "REP",
            SocketPattern::Publish => "PUB",
            SocketPattern::Subscribe => "SUB",
            SocketPattern::Push => "PUSH",
            SocketPattern::Pull => "PULL",
        }
    }

    pub fn zmq_type(&self) -> zmq::SocketType {
        match self {
            SocketPattern::Request => zmq::REQ,
            SocketPattern::Reply => zmq::REP,
            SocketPattern::Publish => zmq::PUB,
            SocketPattern::Subscribe => zmq::SUB,
            SocketPattern::Push => zmq::PUSH,
            SocketPattern::Pull => zmq::PULL,
        }
    }

    /// Server roles bind on a wildcard host; client roles connect.
    pub fn is_server_role(&self) -> bool {
        matches!(
            self,
            SocketPattern::Reply | SocketPattern::Publish | SocketPattern::Pull
        )
    }

    /// Patterns that can receive and therefore host a receive loop.
    pub fn can_receive(&self) -> bool {
        !matches!(self, SocketPattern::Publish | SocketPattern::Push)
    }

    /// Patterns that can send without a preceding receive.
    pub fn can_send(&self) -> bool {
        !matches!(self, SocketPattern::Subscribe | SocketPattern::Pull)
    }
}

impl fmt::Display for SocketPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketPattern {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "req" | "request" => Ok(SocketPattern::Request),
            "rep" | "reply" => Ok(SocketPattern::Reply),
            "pub" | "publish" => Ok(SocketPattern::Publish),
            "sub" | "subscribe" => Ok(SocketPattern::Subscribe),
            "push" => Ok(SocketPattern::Push),
            "pull" => Ok(SocketPattern::Pull),
            other => Err(TransferError::UnsupportedPattern(other.to_string())),
        }
    }
}

/// Socket options fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuning {
    pub linger_ms: i32,
    pub high_water_mark: i32,
    /// Applied only when positive.
    pub recv_timeout_ms: i32,
    /// Applied only when positive.
    pub send_timeout_ms: i32,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            linger_ms: 1000,
            high_water_mark: 1000,
            recv_timeout_ms: 5000,
            send_timeout_ms: 5000,
        }
    }
}

impl SocketTuning {
    pub(crate) fn apply(&self, socket: &zmq::Socket) -> Result<()> {
        socket.set_linger(self.linger_ms)?;
        socket.set_sndhwm(self.high_water_mark)?;
        socket.set_rcvhwm(self.high_water_mark)?;
        if self.recv_timeout_ms > 0 {
            socket.set_rcvtimeo(self.recv_timeout_ms)?;
        }
        if self.send_timeout_ms > 0 {
            socket.set_sndtimeo(self.send_timeout_ms)?;
        }
        Ok(())
    }
}

/// One live socket registered under a logical name.
pub struct SocketHandle {
    name: String,
    pattern: SocketPattern,
    tuning: SocketTuning,
    endpoint: Mutex<Option<String>>,
    topics: Vec<String>,
    /// `None` once closed.
    socket: Mutex<Option<zmq::Socket>>,
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("endpoint", &self.endpoint())
            .field("tuning", &self.tuning)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SocketHandle {
    /// Creates and tunes a socket. SUB sockets subscribe to `topics`, or to
    /// the empty prefix when no topics are given.
    pub(crate) fn open(
        context: &zmq::Context,
        name: &str,
        pattern: SocketPattern,
        tuning: SocketTuning,
        topics: &[String],
    ) -> Result<Self> {
        let socket = context.socket(pattern.zmq_type())?;
        tuning.apply(&socket)?;

        if pattern == SocketPattern::Request {
            // A timed-out request must not wedge the socket in the
            // "awaiting reply" state.
            socket.set_req_relaxed(true)?;
            socket.set_req_correlate(true)?;
        }

        if pattern == SocketPattern::Subscribe {
            if topics.is_empty() {
                socket.set_subscribe(b"")?;
            } else {
                for topic in topics {
                    socket.set_subscribe(topic.as_bytes())?;
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            pattern,
            tuning,
            endpoint: Mutex::new(None),
            topics: topics.to_vec(),
            socket: Mutex::new(Some(socket)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> SocketPattern {
        self.pattern
    }

    pub fn tuning(&self) -> SocketTuning {
        self.tuning
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Endpoint the socket was bound or connected to, if any.
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<zmq::Socket>> {
        // A panic while holding the lock cannot leave the socket in a state
        // worse than the library error that caused it.
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the socket while holding the lock.
    fn with_socket<T>(&self, f: impl FnOnce(&zmq::Socket) -> Result<T>) -> Result<T> {
        match self.lock().as_ref() {
            Some(socket) => f(socket),
            None => Err(TransferError::SocketClosed(self.name.clone())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Unbinds a bound endpoint and drops the socket. Returns false when the
    /// handle was already closed.
    pub fn close(&self) -> bool {
        let Some(socket) = self.lock().take() else {
            return false;
        };
        if self.pattern.is_server_role() {
            if let Some(endpoint) = self.endpoint() {
                if let Err(e) = socket.unbind(&endpoint) {
                    debug!(socket = %self.name, endpoint = %endpoint, error = %e, "Unbind failed");
                }
            }
        }
        drop(socket);
        true
    }

    pub(crate) fn bind(&self, endpoint: &str) -> Result<()> {
        self.with_socket(|socket| {
            socket.bind(endpoint).map_err(|source| TransferError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })
        })?;
        self.set_endpoint(endpoint);
        Ok(())
    }

    pub(crate) fn connect(&self, endpoint: &str) -> Result<()> {
        self.with_socket(|socket| {
            socket.connect(endpoint).map_err(|source| TransferError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })
        })?;
        self.set_endpoint(endpoint);
        Ok(())
    }

    fn set_endpoint(&self, endpoint: &str) {
        *self
            .endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(endpoint.to_string());
    }

    /// Sends a single-part message, bounded by the send timeout.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.with_socket(|socket| socket.send(data, 0).map_err(|e| self.map_timeout(e, false)))
    }

    /// Sends all parts as one multipart message.
    pub fn send_frames<I, T>(&self, frames: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<zmq::Message>,
    {
        self.with_socket(|socket| {
            socket
                .send_multipart(frames, 0)
                .map_err(|e| self.map_timeout(e, false))
        })
    }

    /// Non-blocking multipart send; `Ok(false)` when the send queue is full
    /// or no peer is ready to take the message.
    pub fn try_send_frames<I, T>(&self, frames: I) -> Result<bool>
    where
        I: IntoIterator<Item = T>,
        T: Into<zmq::Message>,
    {
        self.with_socket(|socket| match socket.send_multipart(frames, zmq::DONTWAIT) {
            Ok(()) => Ok(true),
            Err(zmq::Error::EAGAIN) => Ok(false),
            Err(e) => Err(e.into()),
        })
    }

    /// Blocking receive of one part, bounded by the receive timeout.
    pub fn recv(&self) -> Result<Vec<u8>> {
        self.with_socket(|socket| socket.recv_bytes(0).map_err(|e| self.map_timeout(e, true)))
    }

    /// Blocking receive of a multipart message, bounded by the receive timeout.
    pub fn recv_frames(&self) -> Result<Vec<Vec<u8>>> {
        self.with_socket(|socket| {
            socket
                .recv_multipart(0)
                .map_err(|e| self.map_timeout(e, true))
        })
    }

    /// Non-blocking receive; `Ok(None)` when nothing is pending.
    pub fn try_recv_frames(&self) -> Result<Option<Vec<Vec<u8>>>> {
        self.with_socket(|socket| match socket.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => Ok(Some(frames)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        })
    }

    /// Sends `request` and waits up to `timeout` for one reply.
    ///
    /// The receive timeout is overridden for the duration of the call and
    /// restored afterwards, also when the send or receive fails. Returns
    /// `Ok(None)` when no reply arrived in time.
    pub fn request(&self, request: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.with_socket(|socket| {
            let guard = RecvTimeoutGuard::new(socket, timeout)?;

            socket.send(request, 0)?;
            let reply = match socket.recv_bytes(0) {
                Ok(bytes) => Some(bytes),
                Err(zmq::Error::EAGAIN) => {
                    debug!(socket = %self.name, ?timeout, "No reply before timeout");
                    None
                }
                Err(e) => return Err(e.into()),
            };

            drop(guard);
            Ok(reply)
        })
    }

    /// Current ZMQ_RCVTIMEO in milliseconds.
    pub fn recv_timeout_ms(&self) -> Result<i32> {
        self.with_socket(|socket| Ok(socket.get_rcvtimeo()?))
    }

    fn map_timeout(&self, err: zmq::Error, receiving: bool) -> TransferError {
        if err == zmq::Error::EAGAIN {
            let ms = if receiving {
                self.tuning.recv_timeout_ms
            } else {
                self.tuning.send_timeout_ms
            };
            TransferError::Timeout(Duration::from_millis(ms.max(0) as u64))
        } else {
            TransferError::Socket(err)
        }
    }
}

/// Restores the receive timeout captured at construction when dropped.
struct RecvTimeoutGuard<'a> {
    socket: &'a zmq::Socket,
    previous_ms: i32,
}

impl<'a> RecvTimeoutGuard<'a> {
    fn new(socket: &'a zmq::Socket, timeout: Duration) -> Result<Self> {
        let previous_ms = socket.get_rcvtimeo()?;
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        socket.set_rcvtimeo(timeout_ms)?;
        Ok(Self {
            socket,
            previous_ms,
        })
    }
}

impl Drop for RecvTimeoutGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.socket.set_rcvtimeo(self.previous_ms) {
            warn!(error = %e, "Failed to restore receive timeout");
        }
    }
}
