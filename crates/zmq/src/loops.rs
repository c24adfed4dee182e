//! Background pattern loops and the workers that own them.
//!
//! Three loop kinds run as tokio tasks, one per active socket:
//!
//! - **publish**: sends a topic's current content (or a generator's output)
//!   in bridge frames at the topic's frequency.
//! - **subscribe**: polls a receiving socket and hands each non-empty
//!   message to a callback.
//! - **server**: polls a REP/PULL socket and passes requests to a handler;
//!   REP sockets always send exactly one reply per request.
//!
//! All receives and loop sends are non-blocking. Sleeping between ticks is
//! the only suspension point, and every sleep races the loop's cancellation
//! token, so `stop` takes effect at the next tick boundary.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use serde_json::json;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    codec::{self, Payload},
    config::MessageFormat,
    error::TransferError,
    frequency::FrequencyController,
    params::ParamStore,
    socket::{SocketHandle, SocketPattern},
    topics::PublishTopics,
};

/// Error type returned by user callbacks, handlers and generators.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type CallbackResult<T = ()> = std::result::Result<T, CallbackError>;

/// Handles a request and optionally produces a reply.
pub type RequestHandler = Arc<dyn Fn(Payload) -> CallbackResult<Option<Payload>> + Send + Sync>;

/// Produces the content for the next publish tick.
pub type ContentGenerator = Arc<dyn Fn() -> CallbackResult<Payload> + Send + Sync>;

/// Sleep between ticks when a publish rate is zero.
const UNTHROTTLED_TICK: Duration = Duration::from_secs(1);

/// Subscriber callback, chosen explicitly at registration.
#[derive(Clone)]
pub enum SubscriberCallback {
    /// Receives only the resolved content.
    Content(Arc<dyn Fn(Payload) -> CallbackResult + Send + Sync>),
    /// Receives the topic frame (empty for single-frame messages) and the
    /// resolved content.
    WithTopic(Arc<dyn Fn(String, Payload) -> CallbackResult + Send + Sync>),
}

impl SubscriberCallback {
    pub fn content<F>(f: F) -> Self
    where
        F: Fn(Payload) -> CallbackResult + Send + Sync + 'static,
    {
        SubscriberCallback::Content(Arc::new(f))
    }

    pub fn with_topic<F>(f: F) -> Self
    where
        F: Fn(String, Payload) -> CallbackResult + Send + Sync + 'static,
    {
        SubscriberCallback::WithTopic(Arc::new(f))
    }

    pub(crate) fn invoke(&self, topic: Option<String>, payload: Payload) -> CallbackResult {
        match self {
            SubscriberCallback::Content(f) => f(payload),
            SubscriberCallback::WithTopic(f) => f(topic.unwrap_or_default(), payload),
        }
    }
}

impl fmt::Debug for SubscriberCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberCallback::Content(_) => f.write_str("SubscriberCallback::Content"),
            SubscriberCallback::WithTopic(_) => f.write_str("SubscriberCallback::WithTopic"),
        }
    }
}

/// Options of a subscriber loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Deliver at most this many messages per second; extra messages are
    /// dropped.
    pub rate_limit_hz: Option<f64>,
    /// Stop the loop on the first callback error instead of logging it.
    pub fatal_on_error: bool,
}

/// Settings read from the parameter store at every tick.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub format: MessageFormat,
    pub idle_sleep: Duration,
    pub show_content: bool,
    pub max_message_length: usize,
    pub verbose: bool,
}

impl LoopSettings {
    pub(crate) fn log_message(&self, socket: &str, direction: &str, payload: &Payload) {
        let body = if self.show_content {
            codec::preview(payload, self.max_message_length)
        } else {
            String::new()
        };
        if self.verbose {
            debug!(socket, direction, body = %body, "Message");
        } else {
            trace!(socket, direction, body = %body, "Message");
        }
    }
}

/// Where a publish loop takes its content from.
#[derive(Clone)]
pub enum PublishSource {
    /// A registered publish topic, looked up by key on every tick.
    Topic {
        key: String,
        topics: Arc<PublishTopics>,
    },
    /// A generator called on every tick.
    Generator {
        topic: String,
        frequency: f64,
        generator: ContentGenerator,
    },
}

impl PublishSource {
    pub(crate) fn frequency(&self) -> Option<f64> {
        match self {
            PublishSource::Topic { key, topics } => topics.get(key).ok().map(|e| e.frequency),
            PublishSource::Generator { frequency, .. } => Some(*frequency),
        }
    }

    pub(crate) fn next(&self) -> Option<(String, Payload)> {
        match self {
            PublishSource::Topic { key, topics } => match topics.get(key) {
                Ok(entry) => Some((entry.topic, entry.content)),
                Err(_) => {
                    debug!(key, "Publish topic removed, tick skipped");
                    None
                }
            },
            PublishSource::Generator {
                topic, generator, ..
            } => match generator() {
                Ok(payload) => Some((topic.clone(), payload)),
                Err(e) => {
                    error!(topic, error = %e, "Content generator failed, tick skipped");
                    None
                }
            },
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first; returns false when
/// cancelled.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

/// Drives `source` at its frequency until `cancel` fires or `open` turns
/// false, handing each produced message to `emit`. The frequency is re-read
/// on every tick.
pub(crate) async fn drive_publish<O, E>(
    source: &PublishSource,
    cancel: &CancellationToken,
    open: O,
    mut emit: E,
) where
    O: Fn() -> bool,
    E: FnMut(&str, &Payload),
{
    let mut gate = FrequencyController::new(source.frequency().unwrap_or(0.0));

    while !cancel.is_cancelled() && open() {
        if let Some(hz) = source.frequency() {
            if hz != gate.frequency() {
                gate.set_frequency(hz);
            }
        }

        if gate.should_fire(Instant::now()) {
            if let Some((topic, payload)) = source.next() {
                emit(&topic, &payload);
            }
        }

        let wait = if gate.interval().is_zero() {
            UNTHROTTLED_TICK
        } else {
            gate.remaining(Instant::now())
        };
        if !pause(cancel, wait).await {
            break;
        }
    }
}

pub(crate) async fn publish_loop(
    handle: Arc<SocketHandle>,
    source: PublishSource,
    params: Arc<ParamStore>,
    cancel: CancellationToken,
) {
    let socket = handle.name();
    debug!(socket, "Publish loop started");

    drive_publish(
        &source,
        &cancel,
        || !handle.is_closed(),
        |topic, payload| publish_once(&handle, topic, payload, &params.loop_settings()),
    )
    .await;

    debug!(socket, "Publish loop stopped");
}

fn publish_once(handle: &SocketHandle, topic: &str, payload: &Payload, settings: &LoopSettings) {
    let frames = match payload
        .content_bytes()
        .and_then(|content| codec::build_frames(topic, &content))
    {
        Ok(frames) => frames,
        Err(e) => {
            error!(socket = handle.name(), topic, error = %e, "Failed to encode publish content");
            return;
        }
    };

    match handle.try_send_frames(frames) {
        Ok(true) => settings.log_message(handle.name(), "publish", payload),
        Ok(false) => warn!(socket = handle.name(), topic, "Send queue full, tick skipped"),
        Err(e) => error!(socket = handle.name(), topic, error = %e, "Publish failed"),
    }
}

/// Resolves a received multipart message into `(topic, content)`.
///
/// - one frame: the frame is the content, there is no topic;
/// - two or more: frame 0 is the topic and frame 1 the content, unless a
///   non-empty frame 2 exists, which then replaces frame 1. When frame 1 is
///   a 4-byte length frame it must match frame 2, and a consistent inner
///   content prefix is stripped.
///
/// Returns `Ok(None)` when the resolved content is empty.
pub fn resolve_frames(
    mut frames: Vec<Vec<u8>>,
) -> crate::Result<Option<(Option<String>, Vec<u8>)>> {
    let (topic, content) = match frames.len() {
        0 => return Ok(None),
        1 => (None, frames.swap_remove(0)),
        _ => {
            let mut parts = frames.into_iter();
            let topic = parts.next().unwrap_or_default();
            let primary = parts.next().unwrap_or_default();
            let content = match parts.next() {
                Some(payload) if !payload.is_empty() => {
                    if primary.len() == 4 {
                        let declared = codec::read_length_frame(&primary)?;
                        if declared != payload.len() {
                            return Err(TransferError::MalformedFrame(format!(
                                "length frame says {declared} bytes, payload frame has {}",
                                payload.len()
                            )));
                        }
                        codec::unwrap_bridge_payload(&payload).to_vec()
                    } else {
                        payload
                    }
                }
                _ => primary,
            };
            (Some(String::from_utf8_lossy(&topic).into_owned()), content)
        }
    };

    Ok((!content.is_empty()).then_some((topic, content)))
}

pub(crate) async fn subscriber_loop(
    handle: Arc<SocketHandle>,
    callback: SubscriberCallback,
    options: SubscribeOptions,
    params: Arc<ParamStore>,
    cancel: CancellationToken,
) {
    let socket = handle.name();
    let mut gate = options.rate_limit_hz.map(FrequencyController::new);
    debug!(socket, ?options, "Subscriber loop started");

    while !cancel.is_cancelled() {
        let settings = params.loop_settings();

        let frames = match handle.try_recv_frames() {
            Ok(Some(frames)) => frames,
            Ok(None) => {
                if !pause(&cancel, settings.idle_sleep).await {
                    break;
                }
                continue;
            }
            Err(TransferError::SocketClosed(_)) => {
                debug!(socket, "Socket closed under the loop");
                break;
            }
            Err(e) => {
                warn!(socket, error = %e, "Receive failed");
                if !pause(&cancel, settings.idle_sleep).await {
                    break;
                }
                continue;
            }
        };

        let (topic, content) = match resolve_frames(frames) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => continue,
            Err(e) => {
                warn!(socket, error = %e, "Dropping malformed message");
                continue;
            }
        };

        if let Some(gate) = gate.as_mut() {
            if !gate.should_fire(Instant::now()) {
                trace!(socket, "Rate limit reached, message dropped");
                tokio::task::yield_now().await;
                continue;
            }
        }

        let payload = match codec::decode(&content, settings.format) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(socket, error = %e, "Dropping undecodable message");
                continue;
            }
        };
        settings.log_message(socket, "receive", &payload);

        if let Err(e) = callback.invoke(topic, payload) {
            if options.fatal_on_error {
                error!(socket, error = %e, "Subscriber callback failed, stopping loop");
                break;
            }
            error!(socket, error = %e, "Subscriber callback failed");
            if !pause(&cancel, settings.idle_sleep).await {
                break;
            }
            continue;
        }

        tokio::task::yield_now().await;
    }

    debug!(socket, "Subscriber loop stopped");
}

pub(crate) async fn server_loop(
    handle: Arc<SocketHandle>,
    handler: RequestHandler,
    params: Arc<ParamStore>,
    cancel: CancellationToken,
) {
    let socket = handle.name();
    let must_reply = handle.pattern() == SocketPattern::Reply;
    debug!(socket, must_reply, "Server loop started");

    while !cancel.is_cancelled() {
        let settings = params.loop_settings();

        let frames = match handle.try_recv_frames() {
            Ok(Some(frames)) => frames,
            Ok(None) => {
                if !pause(&cancel, settings.idle_sleep).await {
                    break;
                }
                continue;
            }
            Err(TransferError::SocketClosed(_)) => {
                debug!(socket, "Socket closed under the loop");
                break;
            }
            Err(e) => {
                warn!(socket, error = %e, "Receive failed");
                if !pause(&cancel, settings.idle_sleep).await {
                    break;
                }
                continue;
            }
        };

        let request = request_content(frames)
            .and_then(|bytes| codec::decode(&bytes, settings.format));

        let outcome = match request {
            Ok(payload) => {
                settings.log_message(socket, "request", &payload);
                handler(payload).map_err(|e| e.to_string())
            }
            Err(e) => {
                warn!(socket, error = %e, "Undecodable request");
                Err(e.to_string())
            }
        };

        if must_reply {
            let reply = reply_bytes(outcome, settings.format);
            match send_reply(&handle, &reply, settings.idle_sleep, &cancel).await {
                Ok(()) => {}
                Err(TransferError::NotRunning) => break,
                Err(e) => error!(socket, error = %e, "Failed to send reply"),
            }
        } else if let Err(e) = outcome {
            error!(socket, error = %e, "Request handler failed");
        }

        tokio::task::yield_now().await;
    }

    debug!(socket, "Server loop stopped");
}

/// Sends one reply frame without blocking the runtime. A full queue is
/// retried every `retry` until the socket's send timeout elapses.
/// Cancellation while waiting yields `NotRunning`.
async fn send_reply(
    handle: &SocketHandle,
    reply: &[u8],
    retry: Duration,
    cancel: &CancellationToken,
) -> crate::Result<()> {
    let limit = Duration::from_millis(handle.tuning().send_timeout_ms.max(0) as u64);
    let deadline = Instant::now() + limit;
    loop {
        if handle.try_send_frames([reply])? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::Timeout(limit));
        }
        if !pause(cancel, retry).await {
            return Err(TransferError::NotRunning);
        }
    }
}

/// Single-frame requests are taken as-is; multi-frame requests must be
/// bridge frames.
fn request_content(mut frames: Vec<Vec<u8>>) -> crate::Result<Vec<u8>> {
    if frames.len() == 1 {
        return Ok(frames.swap_remove(0));
    }
    codec::parse_frames(&frames).map(|message| message.content)
}

/// Bytes sent back on a REP socket. Handler failures become an error
/// document so that the requester is never left waiting.
fn reply_bytes(outcome: std::result::Result<Option<Payload>, String>, format: MessageFormat) -> Vec<u8> {
    let payload = match outcome {
        Ok(Some(payload)) => payload,
        Ok(None) => return Vec::new(),
        Err(reason) => Payload::Json(json!({ "status": "error", "error": reason })),
    };
    match codec::encode(&payload, format) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Reply could not be encoded, sending error document");
            json!({ "status": "error", "error": e.to_string() })
                .to_string()
                .into_bytes()
        }
    }
}

/// Handler that echoes the request: `{"status": "ok", "echo": <request>}`.
pub fn default_handler() -> RequestHandler {
    Arc::new(|request: Payload| {
        Ok(Some(Payload::Json(json!({
            "status": "ok",
            "echo": request.into_json(),
        }))))
    })
}

/// Callback that logs every message at INFO.
pub fn default_callback(max_message_length: usize) -> SubscriberCallback {
    SubscriberCallback::with_topic(move |topic, payload| {
        info!(
            topic = %topic,
            content = %codec::preview(&payload, max_message_length),
            "Message received"
        );
        Ok(())
    })
}

/// Kind of a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Publish,
    Subscribe,
    Server,
}

struct Worker {
    id: u64,
    socket: String,
    kind: LoopKind,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Outcome of stopping a set of loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    pub abandoned: usize,
}

/// Owns every spawned loop together with its cancellation token.
pub struct Workers {
    root: Mutex<CancellationToken>,
    workers: Mutex<Vec<Worker>>,
    next_id: AtomicU64,
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

impl Workers {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(CancellationToken::new()),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn list(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces a cancelled root token so loops can be started again.
    pub fn renew(&self) {
        let mut root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if root.is_cancelled() {
            *root = CancellationToken::new();
        }
    }

    /// Child of the root token; cancelled by `shutdown`.
    pub fn token(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .child_token()
    }

    /// Spawns a loop for `socket`. The loop receives a child of the root
    /// token. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&self, socket: &str, kind: LoopKind, make: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.token();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(make(cancel.clone()));

        let mut workers = self.list();
        workers.retain(|w| !w.join.is_finished());
        workers.push(Worker {
            id,
            socket: socket.to_string(),
            kind,
            cancel,
            join,
        });
        debug!(id, socket, ?kind, "Loop spawned");
        id
    }

    /// Number of loops that have not finished.
    pub fn active(&self) -> usize {
        self.list().iter().filter(|w| !w.join.is_finished()).count()
    }

    /// Running loops as `(socket, kind)` pairs.
    pub fn describe(&self) -> Vec<(String, LoopKind)> {
        self.list()
            .iter()
            .filter(|w| !w.join.is_finished())
            .map(|w| (w.socket.clone(), w.kind))
            .collect()
    }

    pub fn has_loop(&self, socket: &str) -> bool {
        self.list()
            .iter()
            .any(|w| w.socket == socket && !w.cancel.is_cancelled() && !w.join.is_finished())
    }

    /// True once `shutdown` ran and `renew` has not been called since.
    pub fn is_stopped(&self) -> bool {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_cancelled()
    }

    /// Signals the loops of one socket without waiting for them. They stay
    /// tracked until they finish, so `shutdown` still joins them.
    pub fn cancel_socket(&self, socket: &str) -> usize {
        let workers = self.list();
        let mut cancelled = 0;
        for worker in workers.iter().filter(|w| w.socket == socket) {
            if !worker.cancel.is_cancelled() {
                worker.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Stops the loops of one socket.
    pub async fn stop_socket(&self, socket: &str, timeout: Duration) -> ShutdownReport {
        let selected: Vec<Worker> = {
            let mut workers = self.list();
            let (selected, rest): (Vec<Worker>, Vec<Worker>) =
                workers.drain(..).partition(|w| w.socket == socket);
            *workers = rest;
            selected
        };
        Self::join_all(selected, timeout).await
    }

    /// Cancels every loop and joins each within `timeout`; loops that do
    /// not finish in time are aborted and counted as abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
        let all: Vec<Worker> = self.list().drain(..).collect();
        Self::join_all(all, timeout).await
    }

    async fn join_all(workers: Vec<Worker>, timeout: Duration) -> ShutdownReport {
        for worker in &workers {
            worker.cancel.cancel();
        }

        let mut report = ShutdownReport::default();
        for mut worker in workers {
            match time::timeout(timeout, &mut worker.join).await {
                Ok(Ok(())) => report.joined += 1,
                Ok(Err(e)) => {
                    warn!(id = worker.id, socket = %worker.socket, error = %e, "Loop ended abnormally");
                    report.joined += 1;
                }
                Err(_) => {
                    warn!(
                        id = worker.id,
                        socket = %worker.socket,
                        ?timeout,
                        "Loop did not stop in time, abandoning"
                    );
                    worker.join.abort();
                    report.abandoned += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{registry::SocketRegistry, socket::SocketTuning};

    fn tuning() -> SocketTuning {
        SocketTuning {
            linger_ms: 0,
            high_water_mark: 1000,
            recv_timeout_ms: 2000,
            send_timeout_ms: 2000,
        }
    }

    fn pair(
        registry: &SocketRegistry,
        endpoint: &str,
        server: SocketPattern,
        client: SocketPattern,
    ) -> (Arc<SocketHandle>, Arc<SocketHandle>) {
        let s = registry.create("server", server, tuning(), &[]).unwrap();
        s.bind(endpoint).unwrap();
        let c = registry.create("client", client, tuning(), &[]).unwrap();
        c.connect(endpoint).unwrap();
        (s, c)
    }

    #[test]
    fn test_resolve_two_frames() {
        let resolved = resolve_frames(vec![b"news".to_vec(), b"hi".to_vec()]).unwrap();
        assert_eq!(resolved, Some((Some("news".into()), b"hi".to_vec())));
    }

    #[test]
    fn test_resolve_third_frame_overrides() {
        let frames = vec![b"news".to_vec(), vec![11, 0, 0, 0], b"hello world".to_vec()];
        let resolved = resolve_frames(frames).unwrap();
        assert_eq!(resolved, Some((Some("news".into()), b"hello world".to_vec())));
    }

    #[test]
    fn test_resolve_empty_third_frame_keeps_second() {
        let frames = vec![b"news".to_vec(), b"primary".to_vec(), Vec::new()];
        let resolved = resolve_frames(frames).unwrap();
        assert_eq!(resolved, Some((Some("news".into()), b"primary".to_vec())));
    }

    #[test]
    fn test_resolve_bridge_frames_strip_prefix() {
        let frames = codec::build_frames("/chatter", b"hello").unwrap().to_vec();
        let resolved = resolve_frames(frames).unwrap();
        assert_eq!(resolved, Some((Some("/chatter".into()), b"hello".to_vec())));
    }

    #[test]
    fn test_resolve_length_mismatch_is_malformed() {
        let frames = vec![b"news".to_vec(), vec![3, 0, 0, 0], b"hello".to_vec()];
        assert!(matches!(
            resolve_frames(frames),
            Err(TransferError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_resolve_empty_content_is_skipped() {
        assert_eq!(resolve_frames(vec![b"news".to_vec(), Vec::new()]).unwrap(), None);
        assert_eq!(resolve_frames(vec![Vec::new()]).unwrap(), None);
        assert_eq!(
            resolve_frames(vec![b"single".to_vec()]).unwrap(),
            Some((None, b"single".to_vec()))
        );
    }

    #[test]
    fn test_reply_bytes() {
        assert!(reply_bytes(Ok(None), MessageFormat::Json).is_empty());
        let err = reply_bytes(Err("boom".into()), MessageFormat::Json);
        let doc: serde_json::Value = serde_json::from_slice(&err).unwrap();
        assert_eq!(doc["status"], "error");
        assert_eq!(doc["error"], "boom");
    }

    #[test]
    fn test_default_handler_echoes() {
        let reply = default_handler()(Payload::Json(json!({"ping": 1}))).unwrap();
        assert_eq!(
            reply,
            Some(Payload::Json(json!({"status": "ok", "echo": {"ping": 1}})))
        );
    }

    #[tokio::test]
    async fn test_subscriber_loop_delivers_and_stops() {
        let registry = SocketRegistry::new();
        let (pull, push) = pair(
            &registry,
            "inproc://loops-sub",
            SocketPattern::Pull,
            SocketPattern::Push,
        );
        let params = Arc::new(ParamStore::default());
        let workers = Workers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let callback = SubscriberCallback::with_topic(move |topic, payload| {
            tx.send((topic, payload))?;
            Ok(())
        });
        workers.spawn("server", LoopKind::Subscribe, |cancel| {
            subscriber_loop(pull, callback, SubscribeOptions::default(), params, cancel)
        });

        push.send_frames(codec::build_frames("/chatter", b"hello").unwrap())
            .unwrap();

        let (topic, payload) = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "/chatter");
        assert_eq!(payload, Payload::Text("hello".into()));

        let report = workers.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report, ShutdownReport { joined: 1, abandoned: 0 });
        assert_eq!(workers.active(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_loop_survives_malformed_and_callback_errors() {
        let registry = SocketRegistry::new();
        let (pull, push) = pair(
            &registry,
            "inproc://loops-errors",
            SocketPattern::Pull,
            SocketPattern::Push,
        );
        let params = Arc::new(ParamStore::default());
        let workers = Workers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&calls);
        let callback = SubscriberCallback::content(move |payload| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("first call fails".into());
            }
            tx.send(payload)?;
            Ok(())
        });
        workers.spawn("server", LoopKind::Subscribe, |cancel| {
            subscriber_loop(pull, callback, SubscribeOptions::default(), params, cancel)
        });

        push.send_frames(vec![b"t".to_vec(), vec![9, 0, 0, 0], b"short".to_vec()])
            .unwrap();
        push.send_frames(vec![b"t".to_vec(), b"first".to_vec()]).unwrap();
        push.send_frames(vec![b"t".to_vec(), b"second".to_vec()]).unwrap();

        let payload = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Payload::Text("second".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_fatal_on_error_ends_loop() {
        let registry = SocketRegistry::new();
        let (pull, push) = pair(
            &registry,
            "inproc://loops-fatal",
            SocketPattern::Pull,
            SocketPattern::Push,
        );
        let params = Arc::new(ParamStore::default());
        let workers = Workers::new();

        let callback = SubscriberCallback::content(|_| Err("fatal".into()));
        let options = SubscribeOptions {
            fatal_on_error: true,
            ..SubscribeOptions::default()
        };
        workers.spawn("server", LoopKind::Subscribe, |cancel| {
            subscriber_loop(pull, callback, options, params, cancel)
        });
        push.send(b"boom").unwrap();

        time::timeout(Duration::from_secs(2), async {
            while workers.active() > 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_server_loop_replies_to_every_request() {
        let registry = SocketRegistry::new();
        let (rep, req) = pair(
            &registry,
            "inproc://loops-rep",
            SocketPattern::Reply,
            SocketPattern::Request,
        );
        let params = Arc::new(ParamStore::default());
        let workers = Workers::new();

        let handler: RequestHandler = Arc::new(|request: Payload| match request.as_str() {
            Some("fail") => Err("handler failed".into()),
            _ => Ok(Some(Payload::Json(json!({"status": "ok", "echo": request.into_json()})))),
        });
        workers.spawn("server", LoopKind::Server, |cancel| {
            server_loop(rep, handler, params, cancel)
        });

        let req_clone = Arc::clone(&req);
        let replies = tokio::task::spawn_blocking(move || {
            let ok = req_clone.request(br#"{"n":1}"#, Duration::from_secs(2)).unwrap();
            let failed = req_clone.request(br#""fail""#, Duration::from_secs(2)).unwrap();
            (ok, failed)
        })
        .await
        .unwrap();

        let ok: serde_json::Value = serde_json::from_slice(&replies.0.unwrap()).unwrap();
        assert_eq!(ok, json!({"status": "ok", "echo": {"n": 1}}));
        let failed: serde_json::Value = serde_json::from_slice(&replies.1.unwrap()).unwrap();
        assert_eq!(failed["status"], "error");

        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_reply_answers_pending_request() {
        let registry = SocketRegistry::new();
        let (rep, req) = pair(
            &registry,
            "inproc://loops-send-reply",
            SocketPattern::Reply,
            SocketPattern::Request,
        );
        let cancel = CancellationToken::new();

        req.send(b"ping").unwrap();
        let request = time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(frames) = rep.try_recv_frames().unwrap() {
                    break frames;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(request, vec![b"ping".to_vec()]);

        send_reply(&rep, b"pong", Duration::from_millis(5), &cancel)
            .await
            .unwrap();
        let reply = tokio::task::spawn_blocking(move || req.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"pong".to_vec());

        rep.close();
        assert!(matches!(
            send_reply(&rep, b"late", Duration::from_millis(5), &cancel).await,
            Err(TransferError::SocketClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_loops_exit_when_socket_closed() {
        let registry = SocketRegistry::new();
        let (pull, push) = pair(
            &registry,
            "inproc://loops-closed",
            SocketPattern::Pull,
            SocketPattern::Push,
        );
        let params = Arc::new(ParamStore::default());
        let workers = Workers::new();

        let source = PublishSource::Generator {
            topic: "/gen".into(),
            frequency: 20.0,
            generator: Arc::new(|| Ok(Payload::Text("x".into()))),
        };
        let (server_params, server_socket) = (Arc::clone(&params), Arc::clone(&pull));
        workers.spawn("server", LoopKind::Server, |cancel| {
            server_loop(server_socket, default_handler(), server_params, cancel)
        });
        workers.spawn("client", LoopKind::Publish, |cancel| {
            publish_loop(push, source, params, cancel)
        });
        assert_eq!(workers.active(), 2);

        registry.close_all();
        time::timeout(Duration::from_secs(2), async {
            while workers.active() > 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(pull.is_closed());
    }

    #[tokio::test]
    async fn test_publish_loop_observes_content_updates() {
        let registry = SocketRegistry::new();
        let (pull, push) = pair(
            &registry,
            "inproc://loops-publish",
            SocketPattern::Pull,
            SocketPattern::Push,
        );
        let params = Arc::new(ParamStore::default());
        let topics = Arc::new(PublishTopics::new());
        topics.add("chatter", "/chatter", "v1", 20.0).unwrap();
        let workers = Workers::new();

        let source = PublishSource::Topic {
            key: "chatter".into(),
            topics: Arc::clone(&topics),
        };
        workers.spawn("client", LoopKind::Publish, |cancel| {
            publish_loop(push, source, params, cancel)
        });

        let recv = |pull: Arc<SocketHandle>| async move {
            tokio::task::spawn_blocking(move || pull.recv_frames())
                .await
                .unwrap()
                .unwrap()
        };

        let first = codec::parse_frames(&recv(Arc::clone(&pull)).await).unwrap();
        assert_eq!(first.topic, "/chatter");
        assert_eq!(first.content_str().unwrap(), "v1");

        topics.update_content("chatter", "v2").unwrap();
        // Ticks that read before the update may still be queued; the first
        // post-update tick carries v2 and nothing after it is stale.
        let mut seen_v2 = false;
        for _ in 0..10 {
            let message = codec::parse_frames(&recv(Arc::clone(&pull)).await).unwrap();
            let content = message.content_str().unwrap().to_string();
            if seen_v2 {
                assert_eq!(content, "v2");
                break;
            }
            seen_v2 = content == "v2";
        }
        assert!(seen_v2);

        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_generator_errors_skip_tick() {
        let registry = SocketRegistry::new();
        let (pull, push) = pair(
            &registry,
            "inproc://loops-generator",
            SocketPattern::Pull,
            SocketPattern::Push,
        );
        let params = Arc::new(ParamStore::default());
        let workers = Workers::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        let generator: ContentGenerator = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err("odd tick".into())
            } else {
                Ok(Payload::Text(format!("tick-{n}")))
            }
        });
        let source = PublishSource::Generator {
            topic: "/gen".into(),
            frequency: 50.0,
            generator,
        };
        workers.spawn("client", LoopKind::Publish, |cancel| {
            publish_loop(push, source, params, cancel)
        });

        let frames = tokio::task::spawn_blocking(move || pull.recv_frames())
            .await
            .unwrap()
            .unwrap();
        let message = codec::parse_frames(&frames).unwrap();
        assert_eq!(message.content_str().unwrap(), "tick-1");

        workers.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_stuck_loop() {
        let workers = Workers::new();
        workers.spawn("stuck", LoopKind::Server, |_cancel| async {
            time::sleep(Duration::from_secs(3600)).await;
        });
        workers.spawn("polite", LoopKind::Server, |cancel| async move {
            cancel.cancelled().await;
        });

        let report = workers.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport { joined: 1, abandoned: 1 });
    }

    #[tokio::test]
    async fn test_stop_socket_only_stops_that_socket() {
        let workers = Workers::new();
        for socket in ["a", "b"] {
            workers.spawn(socket, LoopKind::Subscribe, |cancel| async move {
                cancel.cancelled().await;
            });
        }

        let report = workers.stop_socket("a", Duration::from_secs(1)).await;
        assert_eq!(report.joined, 1);
        assert!(!workers.has_loop("a"));
        assert!(workers.has_loop("b"));

        workers.shutdown(Duration::from_secs(1)).await;
        workers.renew();
        workers.spawn("c", LoopKind::Publish, |cancel| async move {
            cancel.cancelled().await;
        });
        assert!(workers.has_loop("c"));
        workers.shutdown(Duration::from_secs(1)).await;
    }
}
