//! Websocket client for the topic bridge.
//!
//! [`BridgeClient`] talks to a robotics middleware bridge over one websocket
//! using the bridge's JSON operations:
//!
//! | operation      | direction | purpose                                   |
//! |----------------|-----------|-------------------------------------------|
//! | `subscribe`    | out       | start receiving a topic                   |
//! | `unsubscribe`  | out       | stop receiving a topic                    |
//! | `advertise`    | out       | announce a topic this client publishes    |
//! | `unadvertise`  | out       | withdraw an advertised topic              |
//! | `publish`      | both      | a message on a topic                      |
//! | `call_service` | out       | invoke a service                          |
//! | `service_response` | in    | the answer to one `call_service`          |
//!
//! Message types are passed through as opaque strings such as
//! `std_msgs/String`; this client never interprets them.
//!
//! One background task owns the socket. It forwards queued outgoing
//! operations, dispatches incoming `publish` messages to subscriber
//! callbacks, completes pending service calls and keeps the connection alive
//! with pings. Subscriptions and publishers survive a lost connection and are
//! re-announced by the next `connect`.
//!
//! # Example
//!
//! ```ignore
//! let bridge = BridgeClient::new(Arc::new(ParamStore::default()));
//! bridge.connect().await?;
//! bridge.create_publisher("/chatter", "std_msgs/String")?;
//! bridge.publish_message("/chatter", "hello")?;
//! let nodes = bridge
//!     .call_service("/rosapi/nodes", "rosapi/Nodes", json!({}), Duration::from_secs(10))
//!     .await?;
//! bridge.disconnect().await;
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{
    tungstenite::{protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    client::LOOP_JOIN_TIMEOUT,
    codec::Payload,
    connectivity::{self, ReconnectPolicy},
    error::TransferError,
    frequency::FrequencyController,
    loops::{self, ContentGenerator, LoopKind, PublishSource, SubscriberCallback, Workers},
    params::ParamStore,
    state::{ConnectionState, StateTracker},
    topics::{self, PublishTopics},
    Result,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wraps a payload into a bridge message body. JSON objects are sent as-is;
/// anything else becomes `{"data": <value>}`, the layout of the standard
/// string and primitive message types.
pub fn message_body(payload: Payload) -> Value {
    match payload.into_json() {
        Value::Object(fields) => Value::Object(fields),
        other => json!({ "data": other }),
    }
}

struct Subscription {
    message_type: String,
    callback: SubscriberCallback,
    gate: Option<FrequencyController>,
}

type ServiceReply = std::result::Result<Value, String>;

/// State shared between the client and its connection task.
struct Shared {
    params: Arc<ParamStore>,
    state: StateTracker,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    /// Advertised topic name to message type.
    publishers: Mutex<HashMap<String, String>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ServiceReply>>>,
    next_id: AtomicU64,
    /// Bumped by every `connect`; a connection task only tears down its own
    /// generation.
    generation: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn is_connected(&self) -> bool {
        locked(&self.outgoing)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn next_id(&self, op: &str, name: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{op}:{name}:{n}")
    }

    /// Queues one operation for the connection task.
    fn send(&self, op: Value) -> Result<()> {
        let outgoing = locked(&self.outgoing);
        let tx = outgoing.as_ref().ok_or(TransferError::NotRunning)?;
        tx.send(Message::Text(op.to_string()))
            .map_err(|_| TransferError::NotRunning)
    }

    fn subscribe_op(&self, topic: &str, message_type: &str) -> Value {
        json!({
            "op": "subscribe",
            "id": self.next_id("subscribe", topic),
            "topic": topic,
            "type": message_type,
            "queue_length": 1,
        })
    }

    fn advertise_op(&self, topic: &str, message_type: &str) -> Value {
        json!({
            "op": "advertise",
            "id": self.next_id("advertise", topic),
            "topic": topic,
            "type": message_type,
            "queue_size": 1,
        })
    }

    fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        if !locked(&self.publishers).contains_key(topic) {
            return Err(TransferError::UnknownTopic(topic.to_string()));
        }
        let settings = self.params.loop_settings();
        settings.log_message(topic, "bridge publish", &payload);
        self.send(json!({
            "op": "publish",
            "topic": topic,
            "msg": message_body(payload),
        }))
    }

    fn dispatch(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable bridge message");
                return;
            }
        };

        match message.get("op").and_then(Value::as_str) {
            Some("publish") => self.deliver(message),
            Some("service_response") => self.complete(message),
            Some("status") => {
                let level = message.get("level").and_then(Value::as_str).unwrap_or("info");
                let msg = message.get("msg").and_then(Value::as_str).unwrap_or_default();
                match level {
                    "error" => error!(status = msg, "Bridge status"),
                    "warning" => warn!(status = msg, "Bridge status"),
                    _ => debug!(status = msg, "Bridge status"),
                }
            }
            other => debug!(op = ?other, "Ignoring bridge message"),
        }
    }

    fn deliver(&self, mut message: Value) {
        let Some(topic) = message.get("topic").and_then(Value::as_str).map(str::to_string) else {
            warn!("Bridge publish without topic dropped");
            return;
        };
        let body = message.get_mut("msg").map(Value::take).unwrap_or(Value::Null);

        let callback = {
            let mut subscriptions = locked(&self.subscriptions);
            let Some(subscription) = subscriptions.get_mut(&topic) else {
                debug!(topic, "Message for a topic without subscription dropped");
                return;
            };
            if let Some(gate) = subscription.gate.as_mut() {
                if !gate.should_fire(Instant::now()) {
                    return;
                }
            }
            subscription.callback.clone()
        };

        let payload = Payload::Json(body);
        self.params
            .loop_settings()
            .log_message(&topic, "bridge receive", &payload);
        if let Err(e) = callback.invoke(Some(topic.clone()), payload) {
            error!(topic, error = %e, "Bridge subscriber callback failed");
        }
    }

    fn complete(&self, mut message: Value) {
        let Some(id) = message.get("id").and_then(Value::as_str).map(str::to_string) else {
            debug!("Service response without id dropped");
            return;
        };
        let Some(reply_tx) = locked(&self.pending).remove(&id) else {
            debug!(id, "Service response for an unknown call dropped");
            return;
        };

        let succeeded = message.get("result").and_then(Value::as_bool).unwrap_or(true);
        let values = message.get_mut("values").map(Value::take).unwrap_or(Value::Null);
        let reply = if succeeded {
            Ok(values)
        } else {
            Err(match values {
                Value::String(reason) => reason,
                other => other.to_string(),
            })
        };
        // The caller may have timed out already.
        let _ = reply_tx.send(reply);
    }

    /// Forgets connection `generation`. Pending service calls fail when their
    /// reply senders drop.
    fn connection_closed(&self, generation: u64, lost: Option<String>) {
        {
            let mut outgoing = locked(&self.outgoing);
            if self.generation.load(Ordering::Acquire) != generation {
                debug!(generation, "Stale bridge connection closed");
                return;
            }
            outgoing.take();
        }
        let failed = locked(&self.pending).drain().count();
        if failed > 0 {
            debug!(failed, "Pending service calls cancelled");
        }
        match lost {
            Some(reason) => {
                warn!(reason = %reason, "Bridge connection lost");
                self.state.set(ConnectionState::Failed(reason));
            }
            None => {
                self.state.set(ConnectionState::Idle);
            }
        }
    }
}

/// Keepalive settings of the connection task.
#[derive(Debug, Clone, Copy)]
struct Keepalive {
    interval: Duration,
    timeout: Duration,
}

async fn next_ping(ticker: &mut Option<time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn connection_task(
    stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    keepalive: Keepalive,
    generation: u64,
    cancel: CancellationToken,
) {
    let (mut sink, mut source) = stream.split();
    let mut ticker = (!keepalive.interval.is_zero()).then(|| {
        time::interval_at(
            time::Instant::now() + keepalive.interval,
            keepalive.interval,
        )
    });
    let mut awaiting_pong: Option<Instant> = None;

    let lost = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(message) = outgoing.try_recv() {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                if sink.send(Message::Close(None)).await.is_ok() {
                    // Wait for the close reply; `disconnect` bounds this.
                    while let Some(Ok(message)) = source.next().await {
                        if matches!(message, Message::Close(_)) {
                            break;
                        }
                    }
                }
                break None;
            }
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        break Some(e.to_string());
                    }
                }
                None => break None,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        break Some(e.to_string());
                    }
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = None,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by bridge: {} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by bridge".to_string());
                    break Some(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break Some("connection ended".to_string()),
            },
            _ = next_ping(&mut ticker) => {
                if let Some(sent) = awaiting_pong {
                    if !keepalive.timeout.is_zero() && sent.elapsed() >= keepalive.timeout {
                        break Some(format!("no pong within {:?}", keepalive.timeout));
                    }
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break Some(e.to_string());
                }
                awaiting_pong.get_or_insert_with(Instant::now);
            }
        }
    };

    shared.connection_closed(generation, lost);
}

struct Link {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Client of the topic bridge.
pub struct BridgeClient {
    shared: Arc<Shared>,
    publish_topics: Arc<PublishTopics>,
    workers: Workers,
    link: Mutex<Option<Link>>,
}

impl BridgeClient {
    /// Creates a disconnected client. Connection settings are read from the
    /// store's `bridge` section at every `connect`.
    pub fn new(params: Arc<ParamStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                params,
                state: StateTracker::new(),
                outgoing: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                publishers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
            publish_topics: Arc::new(PublishTopics::new()),
            workers: Workers::new(),
            link: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &Arc<ParamStore> {
        &self.shared.params
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Opens the websocket to the configured bridge.
    ///
    /// The handshake is retried up to `max_retries` more times,
    /// `retry_interval` apart, all within `connection_timeout`. Existing
    /// subscriptions and publishers are announced again once connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let bridge = self.shared.params.bridge();
        let url = bridge.url();
        self.shared.state.set(ConnectionState::Connecting);
        debug!(url = %url, "Connecting to bridge");

        let attempts = async {
            let mut backoff = Backoff::fixed(bridge.retry_interval(), bridge.max_retries);
            loop {
                match tokio_tungstenite::connect_async_with_config(
                    url.as_str(),
                    Some(websocket_config(bridge.max_size)),
                    true,
                )
                    .await
                {
                    Ok((stream, _response)) => return Ok(stream),
                    Err(e) => match backoff.next_sleep() {
                        Ok(delay) => {
                            debug!(url = %url, error = %e, ?delay, "Bridge handshake failed, retrying");
                            time::sleep(delay).await;
                        }
                        Err(_) => return Err(TransferError::from(e)),
                    },
                }
            }
        };

        let stream = match time::timeout(bridge.connection_timeout(), attempts).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.state.set(ConnectionState::Failed(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                let err = TransferError::Timeout(bridge.connection_timeout());
                self.shared.state.set(ConnectionState::Failed(err.to_string()));
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut outgoing = locked(&self.shared.outgoing);
            *outgoing = Some(tx);
            self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        let cancel = CancellationToken::new();
        let keepalive = Keepalive {
            interval: bridge.ping_interval(),
            timeout: bridge.ping_timeout(),
        };
        let task = tokio::spawn(connection_task(
            stream,
            rx,
            Arc::clone(&self.shared),
            keepalive,
            generation,
            cancel.clone(),
        ));
        let previous = locked(&self.link).replace(Link { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        self.announce()?;
        self.shared.state.set(ConnectionState::Connected);
        info!(url = %url, "Connected to bridge");
        Ok(())
    }

    fn announce(&self) -> Result<()> {
        let subscriptions: Vec<(String, String)> = locked(&self.shared.subscriptions)
            .iter()
            .map(|(topic, s)| (topic.clone(), s.message_type.clone()))
            .collect();
        for (topic, message_type) in subscriptions {
            self.shared.send(self.shared.subscribe_op(&topic, &message_type))?;
        }

        let publishers: Vec<(String, String)> = locked(&self.shared.publishers)
            .iter()
            .map(|(topic, message_type)| (topic.clone(), message_type.clone()))
            .collect();
        for (topic, message_type) in publishers {
            self.shared.send(self.shared.advertise_op(&topic, &message_type))?;
        }
        Ok(())
    }

    /// Connects under the bridge's reconnect policy after an optional
    /// reachability probe. A failed probe only logs; the handshake decides.
    pub async fn start(&self) -> Result<()> {
        let bridge = self.shared.params.bridge();
        let network = self.shared.params.network();
        if network.connectivity_check_enabled {
            connectivity::check_connectivity(&bridge.host, bridge.port, network.connectivity_timeout())
                .await;
        }

        self.workers.renew();
        let cancel = self.workers.token();
        let mut policy = ReconnectPolicy::new(
            bridge.auto_reconnect,
            bridge.reconnect_interval(),
            bridge.max_reconnect_attempts,
        );
        let state = &self.shared.state;
        policy
            .run(
                &cancel,
                |_, delay| {
                    state.set(ConnectionState::Reconnecting(delay.as_secs_f64()));
                },
                || self.connect(),
            )
            .await
    }

    /// Stops auto-publish loops, withdraws every subscription and publisher,
    /// and closes the websocket within `close_timeout`.
    pub async fn disconnect(&self) {
        let report = self.workers.shutdown(LOOP_JOIN_TIMEOUT).await;
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "Auto-publish loops abandoned");
        }

        let topics: Vec<String> = locked(&self.shared.subscriptions).drain().map(|(t, _)| t).collect();
        for topic in topics {
            if let Err(e) = self.shared.send(unsubscribe_op(&self.shared, &topic)) {
                debug!(topic, error = %e, "Unsubscribe not sent");
            }
        }
        let publishers: Vec<String> = locked(&self.shared.publishers).drain().map(|(t, _)| t).collect();
        for topic in publishers {
            if let Err(e) = self.shared.send(json!({ "op": "unadvertise", "topic": topic })) {
                debug!(topic, error = %e, "Unadvertise not sent");
            }
        }

        let link = locked(&self.link).take();
        if let Some(mut link) = link {
            link.cancel.cancel();
            let close_timeout = self.shared.params.bridge().close_timeout();
            if time::timeout(close_timeout, &mut link.task).await.is_err() {
                warn!(?close_timeout, "Bridge connection did not close in time");
                link.task.abort();
            }
        }
        let generation = self.shared.generation.load(Ordering::Acquire);
        self.shared.connection_closed(generation, None);
        debug!("Disconnected from bridge");
    }

    /// Subscribes to `topic`. The callback runs on the connection task; with
    /// `target_hz` set, messages arriving faster are dropped.
    ///
    /// Subscribing to a topic again replaces its callback.
    pub fn subscribe_topic(
        &self,
        topic: &str,
        message_type: &str,
        callback: SubscriberCallback,
        target_hz: Option<f64>,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(TransferError::NotRunning);
        }
        let gate = target_hz.filter(|hz| *hz > 0.0).map(FrequencyController::new);
        locked(&self.shared.subscriptions).insert(
            topic.to_string(),
            Subscription {
                message_type: message_type.to_string(),
                callback,
                gate,
            },
        );
        self.shared.send(self.shared.subscribe_op(topic, message_type))?;
        debug!(topic, message_type, ?target_hz, "Bridge topic subscribed");
        Ok(())
    }

    /// Fails with `UnknownTopic` when `topic` is not subscribed.
    pub fn unsubscribe_topic(&self, topic: &str) -> Result<()> {
        if locked(&self.shared.subscriptions).remove(topic).is_none() {
            return Err(TransferError::UnknownTopic(topic.to_string()));
        }
        if self.is_connected() {
            self.shared.send(unsubscribe_op(&self.shared, topic))?;
        }
        debug!(topic, "Bridge topic unsubscribed");
        Ok(())
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = locked(&self.shared.subscriptions).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Advertises `topic` so that messages can be published on it.
    pub fn create_publisher(&self, topic: &str, message_type: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(TransferError::NotRunning);
        }
        locked(&self.shared.publishers).insert(topic.to_string(), message_type.to_string());
        self.shared.send(self.shared.advertise_op(topic, message_type))?;
        debug!(topic, message_type, "Bridge publisher created");
        Ok(())
    }

    /// Publishes on an advertised topic. See [`message_body`] for how the
    /// payload is wrapped.
    pub fn publish_message(&self, topic: &str, message: impl Into<Payload>) -> Result<()> {
        self.shared.publish(topic, message.into())
    }

    /// Calls a service and waits up to `timeout` for its response values.
    ///
    /// A response with `result: false` yields `TransferError::Bridge`; a
    /// connection lost while waiting yields `NotRunning`.
    pub async fn call_service(
        &self,
        service: &str,
        service_type: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.shared.next_id("call_service", service);
        let (reply_tx, reply_rx) = oneshot::channel();
        locked(&self.shared.pending).insert(id.clone(), reply_tx);

        let args = match args {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let sent = self.shared.send(json!({
            "op": "call_service",
            "id": id,
            "service": service,
            "type": service_type,
            "args": args,
        }));
        if let Err(e) = sent {
            locked(&self.shared.pending).remove(&id);
            return Err(e);
        }
        debug!(service, service_type, "Service called");

        match time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(values))) => Ok(values),
            Ok(Ok(Err(reason))) => Err(TransferError::Bridge(format!("{service}: {reason}"))),
            Ok(Err(_)) => Err(TransferError::NotRunning),
            Err(_) => {
                locked(&self.shared.pending).remove(&id);
                Err(TransferError::Timeout(timeout))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Auto publish
    // ---------------------------------------------------------------------

    /// Registers content that [`Self::start_auto_publish`] publishes on
    /// `topic` at `frequency` Hz.
    pub fn add_publish_topic(
        &self,
        key: &str,
        topic: &str,
        content: impl Into<Payload>,
        frequency: f64,
    ) -> Result<()> {
        self.publish_topics.add(key, topic, content, frequency)
    }

    /// Takes effect at the next tick of a running loop.
    pub fn update_publish_content(&self, key: &str, content: impl Into<Payload>) -> Result<()> {
        self.publish_topics.update_content(key, content)
    }

    pub fn set_publish_frequency(&self, key: &str, frequency: f64) -> Result<()> {
        self.publish_topics.set_frequency(key, frequency)
    }

    pub fn get_publish_content(&self, key: &str) -> Result<Payload> {
        self.publish_topics.content(key)
    }

    /// Publishes the current content of publish topic `key` at its
    /// frequency. The topic must have a publisher. Ticks are skipped while
    /// the connection is down.
    pub fn start_auto_publish(&self, key: &str) -> Result<()> {
        let entry = self.publish_topics.get(key)?;
        self.auto_publish(
            &entry.topic,
            PublishSource::Topic {
                key: key.to_string(),
                topics: Arc::clone(&self.publish_topics),
            },
        )
    }

    /// Publishes the output of `generator` on `topic` at `frequency` Hz.
    pub fn start_auto_publish_with_generator(
        &self,
        topic: &str,
        frequency: f64,
        generator: ContentGenerator,
    ) -> Result<()> {
        topics::check_frequency(topic, frequency)?;
        self.auto_publish(
            topic,
            PublishSource::Generator {
                topic: topic.to_string(),
                frequency,
                generator,
            },
        )
    }

    fn auto_publish(&self, topic: &str, source: PublishSource) -> Result<()> {
        if !locked(&self.shared.publishers).contains_key(topic) {
            return Err(TransferError::UnknownTopic(topic.to_string()));
        }
        let shared = Arc::clone(&self.shared);
        self.workers.spawn(topic, LoopKind::Publish, |cancel| async move {
            loops::drive_publish(&source, &cancel, || true, |topic, payload| {
                if !shared.is_connected() {
                    return;
                }
                if let Err(e) = shared.publish(topic, payload.clone()) {
                    warn!(topic, error = %e, "Auto publish failed");
                }
            })
            .await;
            debug!("Auto publish loop stopped");
        });
        debug!(topic, "Auto publish started");
        Ok(())
    }

    /// Number of running auto-publish loops.
    pub fn auto_publish_loops(&self) -> usize {
        self.workers.active()
    }
}

fn websocket_config(max_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_size);
    config.max_frame_size = Some(max_size);
    config
}

fn unsubscribe_op(shared: &Shared, topic: &str) -> Value {
    json!({
        "op": "unsubscribe",
        "id": shared.next_id("unsubscribe", topic),
        "topic": topic,
    })
}
