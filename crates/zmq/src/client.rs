//! Client facade.
//!
//! [`ZmqClient`] composes the socket registry, the parameter store, the topic
//! registries and the loop workers behind one object. Applications typically:
//!
//! 1. build a client from a validated [`Config`],
//! 2. optionally register handlers, callbacks and publish topics,
//! 3. call [`ZmqClient::start`], which sets up every enabled configured
//!    pattern under the reconnection policy and starts their loops,
//! 4. call [`ZmqClient::stop`] on shutdown.
//!
//! Sockets and loops can also be created ad hoc through the `create_*` and
//! `start_*_loop` helpers, before or after `start`.
//!
//! # Typical Usage
//!
//! ```ignore
//! let client = ZmqClient::new(config)?;
//! client.register_callback("telemetry", SubscriberCallback::content(|payload| {
//!     println!("{payload}");
//!     Ok(())
//! }));
//! client.add_publish_topic("status", "/robot/status", "idle", 2.0)?;
//!
//! if !client.start().await {
//!     return Err("client failed to start".into());
//! }
//! client.update_publish_content("status", "moving")?;
//! // ...
//! client.stop().await;
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    codec::{self, Payload},
    config::{Config, PatternConfig, PatternKind, PublishTopicConfig},
    connectivity::{self, ReconnectPolicy},
    error::TransferError,
    loops::{
        self, ContentGenerator, LoopKind, PublishSource, RequestHandler, ShutdownReport,
        SubscribeOptions, SubscriberCallback, Workers,
    },
    params::{ParamStore, Section},
    registry::SocketRegistry,
    socket::{SocketHandle, SocketPattern},
    state::{ConnectionState, StateTracker},
    topics::{self, PublishTopic, PublishTopics, SubscribeTopics},
    Result,
};

/// How long `stop` waits for each loop before abandoning it.
pub const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A remote peer to connect a client-role socket to.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
    /// REQ, SUB or PUSH.
    pub pattern: SocketPattern,
    /// Registry name; defaults to `<pattern>_remote`, e.g. `sub_remote`.
    pub name: Option<String>,
    /// Subscription filters (SUB only).
    pub topics: Vec<String>,
    /// Start the default subscriber loop on SUB sockets.
    pub auto_start_loop: bool,
}

impl RemoteHost {
    pub fn new(host: impl Into<String>, port: u16, pattern: SocketPattern) -> Self {
        Self {
            host: host.into(),
            port,
            pattern,
            name: None,
            topics: Vec::new(),
            auto_start_loop: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn auto_start_loop(mut self, enabled: bool) -> Self {
        self.auto_start_loop = enabled;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn socket_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!("{}_remote", self.pattern.as_str().to_ascii_lowercase())
        })
    }
}

/// Point-in-time view of a client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub running: bool,
    pub state: String,
    pub reconnect_attempts: u32,
    pub endpoints: Vec<String>,
    pub sockets: usize,
    pub loops: usize,
}

pub struct ZmqClient {
    params: Arc<ParamStore>,
    registry: SocketRegistry,
    publish_topics: Arc<PublishTopics>,
    subscribe_topics: SubscribeTopics,
    patterns: RwLock<Vec<PatternConfig>>,
    configured_topics: Vec<PublishTopicConfig>,
    handlers: RwLock<HashMap<String, RequestHandler>>,
    callbacks: RwLock<HashMap<String, SubscriberCallback>>,
    workers: Workers,
    state: StateTracker,
    running: AtomicBool,
    reconnect_attempts: AtomicU32,
}

impl ZmqClient {
    /// Creates a client from a configuration.
    ///
    /// The configuration is validated, publish topics listed in it are
    /// registered immediately, and patterns are stored for `start`.
    ///
    /// # Returns
    /// - `Ok(Self)`: Client ready to start
    /// - `Err(TransferError::ConfigError)`: A value is out of range
    pub fn new(config: Config) -> Result<Self> {
        let params = Arc::new(ParamStore::from_config(&config)?);
        let mut client = Self::with_params(params);

        for topic in &config.publish_topics {
            client.publish_topics.add(
                &topic.key,
                &topic.topic,
                Payload::Json(topic.content.clone()),
                topic.frequency,
            )?;
        }
        client.configured_topics = config.publish_topics;
        client.patterns = RwLock::new(config.patterns);

        Ok(client)
    }

    /// Creates a client without configured patterns around an existing
    /// parameter store.
    pub fn with_params(params: Arc<ParamStore>) -> Self {
        Self {
            params,
            registry: SocketRegistry::new(),
            publish_topics: Arc::new(PublishTopics::new()),
            subscribe_topics: SubscribeTopics::new(),
            patterns: RwLock::new(Vec::new()),
            configured_topics: Vec::new(),
            handlers: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            workers: Workers::new(),
            state: StateTracker::new(),
            running: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn params(&self) -> &Arc<ParamStore> {
        &self.params
    }

    // ---------------------------------------------------------------------
    // Sockets
    // ---------------------------------------------------------------------

    /// Creates a socket and binds (server roles) or connects (client roles)
    /// it.
    ///
    /// Tuning comes from the current `zmq` parameters and is fixed for the
    /// socket's lifetime. Without an explicit endpoint the default endpoint
    /// for the pattern is used. A socket already registered under `name` is
    /// replaced: its loops are cancelled and the old socket is closed before
    /// the new one binds, so the endpoint can be reused. When bind or connect
    /// fails the new socket is closed again and the error returned.
    ///
    /// SUB sockets created without topics use the subscribe topic registry;
    /// if that is empty too, they receive everything.
    pub fn create_socket(
        &self,
        pattern: SocketPattern,
        name: &str,
        endpoint: Option<&str>,
        topics: &[String],
    ) -> Result<Arc<SocketHandle>> {
        let zmq = self.params.zmq();
        let endpoint = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| zmq.default_endpoint(pattern));

        let topics = if pattern == SocketPattern::Subscribe && topics.is_empty() {
            self.subscribe_topics.list()
        } else {
            topics.to_vec()
        };

        if self.workers.cancel_socket(name) > 0 {
            debug!(socket = name, "Cancelled loops of replaced socket");
        }
        let released = self
            .registry
            .get(name)
            .ok()
            .and_then(|previous| previous.endpoint());
        let handle = self.registry.create(name, pattern, zmq.tuning(), &topics)?;

        let attached = if pattern.is_server_role() {
            bind_released(&handle, &endpoint, released.as_deref() == Some(endpoint.as_str()))
        } else {
            handle.connect(&endpoint)
        };
        if let Err(e) = attached {
            self.registry.discard(&handle);
            error!(socket = name, endpoint = %endpoint, error = %e, "Socket setup failed");
            return Err(e);
        }

        let action = if pattern.is_server_role() { "bound" } else { "connected" };
        if zmq.show_connection_status {
            info!(socket = name, %pattern, endpoint = %endpoint, ?topics, "Socket {action}");
        } else {
            debug!(socket = name, %pattern, endpoint = %endpoint, ?topics, "Socket {action}");
        }
        Ok(handle)
    }

    pub fn create_request_client(
        &self,
        endpoint: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<SocketHandle>> {
        self.create_socket(
            SocketPattern::Request,
            name.unwrap_or(PatternKind::ReqClient.default_socket_name()),
            endpoint,
            &[],
        )
    }

    pub fn create_reply_server(
        &self,
        endpoint: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<SocketHandle>> {
        self.create_socket(
            SocketPattern::Reply,
            name.unwrap_or(PatternKind::RepServer.default_socket_name()),
            endpoint,
            &[],
        )
    }

    pub fn create_publish_server(
        &self,
        endpoint: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<SocketHandle>> {
        self.create_socket(
            SocketPattern::Publish,
            name.unwrap_or(PatternKind::PubServer.default_socket_name()),
            endpoint,
            &[],
        )
    }

    pub fn create_subscribe_client(
        &self,
        endpoint: Option<&str>,
        name: Option<&str>,
        topics: &[String],
    ) -> Result<Arc<SocketHandle>> {
        self.create_socket(
            SocketPattern::Subscribe,
            name.unwrap_or(PatternKind::SubClient.default_socket_name()),
            endpoint,
            topics,
        )
    }

    pub fn create_push_client(
        &self,
        endpoint: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<SocketHandle>> {
        self.create_socket(
            SocketPattern::Push,
            name.unwrap_or(PatternKind::PushClient.default_socket_name()),
            endpoint,
            &[],
        )
    }

    pub fn create_pull_server(
        &self,
        endpoint: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<SocketHandle>> {
        self.create_socket(
            SocketPattern::Pull,
            name.unwrap_or(PatternKind::PullServer.default_socket_name()),
            endpoint,
            &[],
        )
    }

    /// Stops the socket's loops, then closes it.
    ///
    /// Returns `UnknownSocket` when nothing is registered under `name`.
    pub async fn close_socket(&self, name: &str) -> Result<()> {
        let report = self.workers.stop_socket(name, LOOP_JOIN_TIMEOUT).await;
        if report.abandoned > 0 {
            warn!(socket = name, abandoned = report.abandoned, "Loops abandoned on close");
        }
        self.registry.close(name)?;
        if self.params.zmq().show_connection_status {
            info!(socket = name, "Socket closed");
        }
        Ok(())
    }

    /// Closes a socket created by [`Self::connect_to_remote_host`].
    pub async fn disconnect_from_host(&self, name: &str) -> Result<()> {
        self.close_socket(name).await
    }

    pub fn socket(&self, name: &str) -> Result<Arc<SocketHandle>> {
        self.registry.get(name)
    }

    pub fn socket_names(&self) -> Vec<String> {
        self.registry.names()
    }

    // ---------------------------------------------------------------------
    // Messaging
    // ---------------------------------------------------------------------

    fn sending_socket(&self, name: &str) -> Result<Arc<SocketHandle>> {
        let handle = self.registry.get(name)?;
        if !handle.pattern().can_send() {
            return Err(TransferError::WrongPattern {
                name: name.to_string(),
                expected: "a sending pattern",
                actual: handle.pattern().as_str(),
            });
        }
        Ok(handle)
    }

    fn receiving_socket(&self, name: &str) -> Result<Arc<SocketHandle>> {
        let handle = self.registry.get(name)?;
        if !handle.pattern().can_receive() {
            return Err(TransferError::WrongPattern {
                name: name.to_string(),
                expected: "a receiving pattern",
                actual: handle.pattern().as_str(),
            });
        }
        Ok(handle)
    }

    /// Encodes `payload` in the configured message format and sends it as a
    /// single frame.
    pub fn send_message(&self, name: &str, payload: impl Into<Payload>) -> Result<()> {
        let handle = self.sending_socket(name)?;
        let settings = self.params.loop_settings();
        let payload = payload.into();
        let bytes = codec::encode(&payload, settings.format)?;
        handle.send(&bytes)?;
        settings.log_message(name, "send", &payload);
        Ok(())
    }

    /// Encodes every part in the configured message format and sends them as
    /// one multipart message.
    pub fn send_multipart(&self, name: &str, parts: &[Payload]) -> Result<()> {
        let handle = self.sending_socket(name)?;
        let format = self.params.loop_settings().format;
        let frames = parts
            .iter()
            .map(|part| codec::encode(part, format))
            .collect::<Result<Vec<_>>>()?;
        handle.send_frames(frames)
    }

    /// Sends raw frames unchanged.
    pub fn send_frames(&self, name: &str, frames: Vec<Vec<u8>>) -> Result<()> {
        self.sending_socket(name)?.send_frames(frames)
    }

    /// Sends `content` on `topic` in the three-frame bridge layout.
    pub fn publish_frames(&self, name: &str, topic: &str, content: impl Into<Payload>) -> Result<()> {
        let handle = self.sending_socket(name)?;
        let content = content.into().content_bytes()?;
        handle.send_frames(codec::build_frames(topic, &content)?)
    }

    /// Blocking receive of one message, bounded by the socket's receive
    /// timeout. Returns `Ok(None)` on timeout.
    ///
    /// Multipart messages are resolved the same way the subscriber loop does
    /// it. From async code prefer [`Self::try_receive_message`] or wrap the
    /// call in `spawn_blocking`.
    pub fn receive_message(&self, name: &str) -> Result<Option<Payload>> {
        let handle = self.receiving_socket(name)?;
        match handle.recv_frames() {
            Ok(frames) => self.decode_frames(frames),
            Err(TransferError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Non-blocking variant of [`Self::receive_message`].
    pub fn try_receive_message(&self, name: &str) -> Result<Option<Payload>> {
        match self.receiving_socket(name)?.try_recv_frames()? {
            Some(frames) => self.decode_frames(frames),
            None => Ok(None),
        }
    }

    fn decode_frames(&self, frames: Vec<Vec<u8>>) -> Result<Option<Payload>> {
        let Some((_, content)) = loops::resolve_frames(frames)? else {
            return Ok(None);
        };
        codec::decode(&content, self.params.loop_settings().format).map(Some)
    }

    /// Blocking receive of raw frames. Returns `Ok(None)` on timeout.
    pub fn receive_frames(&self, name: &str) -> Result<Option<Vec<Vec<u8>>>> {
        match self.receiving_socket(name)?.recv_frames() {
            Ok(frames) => Ok(Some(frames)),
            Err(TransferError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sends a request on a REQ socket and waits up to `timeout` for the
    /// reply.
    ///
    /// The socket's receive timeout is overridden for the call and restored
    /// afterwards, also on error. The blocking exchange runs on tokio's
    /// blocking pool.
    ///
    /// # Returns
    /// - `Ok(Some(reply))`: Decoded reply
    /// - `Ok(None)`: No reply within `timeout`
    /// - `Err(TransferError::WrongPattern)`: The socket is not REQ
    pub async fn request_reply(
        &self,
        name: &str,
        request: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Option<Payload>> {
        let handle = self.registry.get(name)?;
        if handle.pattern() != SocketPattern::Request {
            return Err(TransferError::WrongPattern {
                name: name.to_string(),
                expected: SocketPattern::Request.as_str(),
                actual: handle.pattern().as_str(),
            });
        }

        let format = self.params.loop_settings().format;
        let bytes = codec::encode(&request.into(), format)?;
        let reply = tokio::task::spawn_blocking(move || handle.request(&bytes, timeout)).await??;

        match reply {
            Some(bytes) => codec::decode(&bytes, format).map(Some),
            None => {
                warn!(socket = name, ?timeout, "Request timed out");
                Ok(None)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Loops
    // ---------------------------------------------------------------------

    fn loop_socket(
        &self,
        name: &str,
        accepts: impl Fn(SocketPattern) -> bool,
        expected: &'static str,
    ) -> Result<Arc<SocketHandle>> {
        if self.workers.is_stopped() {
            return Err(TransferError::NotRunning);
        }
        let handle = self.registry.get(name)?;
        if !accepts(handle.pattern()) {
            return Err(TransferError::WrongPattern {
                name: name.to_string(),
                expected,
                actual: handle.pattern().as_str(),
            });
        }
        Ok(handle)
    }

    /// Starts a subscriber loop with default options.
    pub fn start_subscriber_loop(&self, name: &str, callback: SubscriberCallback) -> Result<()> {
        self.start_subscriber_loop_with(name, callback, SubscribeOptions::default())
    }

    /// Starts a loop that hands every non-empty message received on `name`
    /// to `callback`.
    pub fn start_subscriber_loop_with(
        &self,
        name: &str,
        callback: SubscriberCallback,
        options: SubscribeOptions,
    ) -> Result<()> {
        let handle = self.loop_socket(name, |p| p.can_receive(), "a receiving pattern")?;
        let params = Arc::clone(&self.params);
        self.workers.spawn(name, LoopKind::Subscribe, |cancel| {
            loops::subscriber_loop(handle, callback, options, params, cancel)
        });
        Ok(())
    }

    /// Starts a loop that passes every request received on a REP or PULL
    /// socket to `handler`. REP sockets reply to every request.
    pub fn start_server_loop(&self, name: &str, handler: RequestHandler) -> Result<()> {
        let handle = self.loop_socket(
            name,
            |p| matches!(p, SocketPattern::Reply | SocketPattern::Pull),
            "REP or PULL",
        )?;
        let params = Arc::clone(&self.params);
        self.workers.spawn(name, LoopKind::Server, |cancel| {
            loops::server_loop(handle, handler, params, cancel)
        });
        Ok(())
    }

    /// Publishes the publish topic `key` on socket `name` at the topic's
    /// frequency. Content and frequency updates are picked up on the next
    /// tick.
    pub fn start_publish_loop(&self, name: &str, key: &str) -> Result<()> {
        let handle = self.loop_socket(name, |p| p.can_send(), "a sending pattern")?;
        if !self.publish_topics.contains(key) {
            return Err(TransferError::UnknownTopic(key.to_string()));
        }
        let source = PublishSource::Topic {
            key: key.to_string(),
            topics: Arc::clone(&self.publish_topics),
        };
        let params = Arc::clone(&self.params);
        self.workers.spawn(name, LoopKind::Publish, |cancel| {
            loops::publish_loop(handle, source, params, cancel)
        });
        Ok(())
    }

    /// Publishes the output of `generator` on `topic` at `frequency` Hz.
    pub fn start_generated_publish_loop(
        &self,
        name: &str,
        topic: &str,
        frequency: f64,
        generator: ContentGenerator,
    ) -> Result<()> {
        let handle = self.loop_socket(name, |p| p.can_send(), "a sending pattern")?;
        topics::check_frequency(topic, frequency)?;
        let source = PublishSource::Generator {
            topic: topic.to_string(),
            frequency,
            generator,
        };
        let params = Arc::clone(&self.params);
        self.workers.spawn(name, LoopKind::Publish, |cancel| {
            loops::publish_loop(handle, source, params, cancel)
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Topic registries
    // ---------------------------------------------------------------------

    pub fn add_publish_topic(
        &self,
        key: &str,
        topic: &str,
        content: impl Into<Payload>,
        frequency: f64,
    ) -> Result<()> {
        self.publish_topics.add(key, topic, content, frequency)
    }

    pub fn update_publish_content(&self, key: &str, content: impl Into<Payload>) -> Result<()> {
        self.publish_topics.update_content(key, content)
    }

    /// Updates every publish topic whose wire name is `topic`.
    pub fn update_publish_content_by_topic(
        &self,
        topic: &str,
        content: impl Into<Payload>,
    ) -> Result<usize> {
        self.publish_topics.update_content_by_topic(topic, content)
    }

    pub fn get_publish_content(&self, key: &str) -> Result<Payload> {
        self.publish_topics.content(key)
    }

    pub fn get_publish_topic(&self, key: &str) -> Result<PublishTopic> {
        self.publish_topics.get(key)
    }

    /// Removes the topic; a running publish loop for it skips its ticks from
    /// then on.
    pub fn remove_publish_topic(&self, key: &str) -> Result<PublishTopic> {
        self.publish_topics.remove(key)
    }

    pub fn set_publish_frequency(&self, key: &str, frequency: f64) -> Result<()> {
        self.publish_topics.set_frequency(key, frequency)
    }

    pub fn publish_topics(&self) -> Vec<String> {
        self.publish_topics.keys()
    }

    /// Adds a filter for SUB sockets created later without explicit topics.
    pub fn add_subscribe_topic(&self, topic: &str) -> bool {
        self.subscribe_topics.add(topic)
    }

    pub fn remove_subscribe_topic(&self, topic: &str) -> bool {
        self.subscribe_topics.remove(topic)
    }

    pub fn subscribe_topics(&self) -> Vec<String> {
        self.subscribe_topics.list()
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    /// Sets the default host and port for sockets created afterwards.
    pub fn set_host_port(&self, host: &str, port: u16) -> Result<()> {
        let mut updates = Map::new();
        updates.insert("host".into(), Value::from(host));
        updates.insert("port".into(), Value::from(port));
        self.params.update(Section::Zmq, &updates)?;
        debug!(host, port, "Default host and port updated");
        Ok(())
    }

    /// Sets one parameter. `section` is `zmq`, `network` or `bridge`.
    pub fn update_config(&self, section: &str, key: &str, value: Value) -> Result<()> {
        self.params.set(section.parse()?, key, value)
    }

    /// Sets several parameters of one section atomically.
    pub fn batch_update_config(&self, section: &str, updates: &Map<String, Value>) -> Result<()> {
        self.params.update(section.parse()?, updates)
    }

    pub fn get_config(&self, section: &str) -> Result<Map<String, Value>> {
        Ok(self.params.get_all(section.parse()?))
    }

    pub fn get_config_value(&self, section: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.params.get(section.parse()?, key))
    }

    // ---------------------------------------------------------------------
    // Configured patterns
    // ---------------------------------------------------------------------

    pub fn patterns(&self) -> Vec<PatternConfig> {
        self.patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Adds a pattern, replacing any pattern with the same name.
    pub fn add_pattern(&self, pattern: PatternConfig) {
        let mut patterns = self
            .patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        patterns.retain(|p| p.name != pattern.name);
        patterns.push(pattern);
    }

    /// Enables a configured pattern, optionally overriding its endpoint and
    /// topics. Takes effect on the next `start`.
    pub fn enable_pattern(
        &self,
        name: &str,
        endpoint: Option<&str>,
        topics: Option<Vec<String>>,
    ) -> Result<()> {
        self.with_pattern(name, |pattern| {
            pattern.enabled = true;
            if let Some(endpoint) = endpoint {
                pattern.endpoint = Some(endpoint.to_string());
            }
            if let Some(topics) = topics {
                pattern.topics = topics;
            }
        })
    }

    pub fn disable_pattern(&self, name: &str) -> Result<()> {
        self.with_pattern(name, |pattern| pattern.enabled = false)
    }

    fn with_pattern(&self, name: &str, change: impl FnOnce(&mut PatternConfig)) -> Result<()> {
        let mut patterns = self
            .patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pattern = patterns
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| TransferError::UnknownPattern(name.to_string()))?;
        change(pattern);
        debug!(pattern = name, enabled = pattern.enabled, "Pattern updated");
        Ok(())
    }

    /// Handler used by the server loop of the configured pattern `pattern`.
    pub fn register_handler(&self, pattern: &str, handler: RequestHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pattern.to_string(), handler);
    }

    /// Callback used by the subscriber loop of the configured pattern
    /// `pattern`.
    pub fn register_callback(&self, pattern: &str, callback: SubscriberCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pattern.to_string(), callback);
    }

    fn handler_for(&self, pattern: &str) -> RequestHandler {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(pattern)
            .cloned()
            .unwrap_or_else(loops::default_handler)
    }

    fn callback_for(&self, pattern: &str) -> SubscriberCallback {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(pattern)
            .cloned()
            .unwrap_or_else(|| loops::default_callback(self.params.zmq().max_message_length))
    }

    fn setup_patterns(&self) -> Result<()> {
        let patterns: Vec<_> = self.patterns().into_iter().filter(|p| p.enabled).collect();
        let mut created: Vec<String> = Vec::with_capacity(patterns.len());

        for pattern in &patterns {
            let name = pattern.socket_name();
            let result = self.create_socket(
                pattern.kind.pattern(),
                &name,
                pattern.endpoint.as_deref(),
                &pattern.topics,
            );
            if let Err(e) = result {
                for name in created {
                    if let Err(close_err) = self.registry.close(&name) {
                        debug!(socket = %name, error = %close_err, "Socket already gone");
                    }
                }
                return Err(e);
            }
            created.push(name);
        }
        Ok(())
    }

    fn start_pattern_loops(&self) {
        for pattern in self.patterns().into_iter().filter(|p| p.enabled) {
            let name = pattern.socket_name();
            let result = match pattern.kind {
                PatternKind::RepServer | PatternKind::PullServer => {
                    self.start_server_loop(&name, self.handler_for(&pattern.name))
                }
                PatternKind::SubClient => {
                    self.start_subscriber_loop(&name, self.callback_for(&pattern.name))
                }
                PatternKind::ReqClient | PatternKind::PubServer | PatternKind::PushClient => {
                    continue
                }
            };
            if let Err(e) = result {
                error!(pattern = %pattern.name, socket = %name, error = %e, "Failed to start loop");
            }
        }

        for topic in &self.configured_topics {
            let Some(socket) = topic.socket.as_deref() else {
                continue;
            };
            if let Err(e) = self.start_publish_loop(socket, &topic.key) {
                error!(key = %topic.key, socket, error = %e, "Failed to start publish loop");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Remote hosts
    // ---------------------------------------------------------------------

    /// Connects a REQ, SUB or PUSH socket to a remote host.
    ///
    /// The host becomes the default host. When the connectivity check is
    /// enabled the host is probed up to `max_retries` more times,
    /// `retry_interval` apart, within `connection_timeout`; an unreachable
    /// host is only logged because ZeroMQ connects lazily.
    pub async fn connect_to_remote_host(&self, remote: &RemoteHost) -> Result<Arc<SocketHandle>> {
        if !matches!(
            remote.pattern,
            SocketPattern::Request | SocketPattern::Subscribe | SocketPattern::Push
        ) {
            return Err(TransferError::UnsupportedPattern(format!(
                "{} cannot connect to a remote host",
                remote.pattern
            )));
        }

        self.set_host_port(&remote.host, remote.port)?;

        let network = self.params.network();
        if network.connectivity_check_enabled {
            let zmq = self.params.zmq();
            let reachable = connectivity::wait_reachable(
                &remote.host,
                remote.port,
                network.connectivity_timeout(),
                zmq.retry_interval(),
                zmq.max_retries,
                zmq.connection_timeout(),
            )
            .await;
            if !reachable {
                warn!(
                    host = %remote.host,
                    port = remote.port,
                    "Remote host not reachable, connecting anyway"
                );
            }
        }

        let name = remote.socket_name();
        let handle = self.create_socket(
            remote.pattern,
            &name,
            Some(&remote.endpoint()),
            &remote.topics,
        )?;

        if remote.pattern == SocketPattern::Subscribe && remote.auto_start_loop {
            let callback = loops::default_callback(self.params.zmq().max_message_length);
            self.start_subscriber_loop(&name, callback)?;
        }
        Ok(handle)
    }

    /// Connects to every host in order; returns `(host:port, success)` per
    /// host.
    pub async fn connect_to_multiple_hosts(&self, hosts: &[RemoteHost]) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(hosts.len());
        for remote in hosts {
            let key = format!("{}:{}", remote.host, remote.port);
            let ok = match self.connect_to_remote_host(remote).await {
                Ok(_) => true,
                Err(e) => {
                    error!(host = %key, error = %e, "Failed to connect to remote host");
                    false
                }
            };
            results.push((key, ok));
        }
        results
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Sets up every enabled configured pattern and starts their loops.
    ///
    /// A failed connectivity probe is only logged. Socket setup runs under
    /// the reconnection policy: with `auto_reconnect` enabled it is retried
    /// up to `max_reconnect_attempts` times, `reconnect_interval` apart.
    ///
    /// # Returns
    /// - `true`: Running; state is `Connected`
    /// - `false`: Setup failed for good; state is `Failed` and nothing is left
    ///   running
    pub async fn start(&self) -> bool {
        if self.is_running() {
            warn!("Client already running");
            return true;
        }

        self.workers.renew();
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.state.set(ConnectionState::Connecting);
        info!(version = env!("CARGO_PKG_VERSION"), "Starting messaging client");

        let zmq = self.params.zmq();
        let network = self.params.network();
        if network.connectivity_check_enabled
            && !connectivity::check_connectivity(&zmq.host, zmq.port, network.connectivity_timeout())
                .await
        {
            warn!("Connectivity check failed, starting anyway");
        }

        let mut policy = ReconnectPolicy::from_params(&zmq);
        let cancel = self.workers.token();
        let result = policy
            .run(
                &cancel,
                |attempt, delay| {
                    self.reconnect_attempts.store(attempt, Ordering::SeqCst);
                    self.state
                        .set(ConnectionState::Reconnecting(delay.as_secs_f64()));
                },
                || {
                    self.state.set(ConnectionState::Connecting);
                    std::future::ready(self.setup_patterns())
                },
            )
            .await;

        match result {
            Ok(()) => {
                self.running.store(true, Ordering::SeqCst);
                self.start_pattern_loops();
                self.state.set(ConnectionState::Connected);
                info!(
                    sockets = self.registry.len(),
                    loops = self.workers.active(),
                    "Messaging client started"
                );
                true
            }
            Err(TransferError::NotRunning) => {
                info!("Start interrupted by stop");
                false
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.reconnect_attempts
                    .store(policy.attempts(), Ordering::SeqCst);
                error!(error = %e, "Messaging client failed to start");
                self.state.set(ConnectionState::Failed(e.to_string()));
                false
            }
        }
    }

    /// Stops every loop, then closes every socket.
    ///
    /// Each loop gets [`LOOP_JOIN_TIMEOUT`] to finish before it is aborted.
    /// Always completes.
    pub async fn stop(&self) -> ShutdownReport {
        info!("Stopping messaging client");
        self.running.store(false, Ordering::SeqCst);

        let report = self.workers.shutdown(LOOP_JOIN_TIMEOUT).await;
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "Some loops did not stop in time");
        }
        let closed = self.registry.close_all();

        self.state.set(ConnectionState::Idle);
        info!(loops = report.joined, sockets = closed, "Messaging client stopped");
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver of connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            running: self.is_running(),
            state: self.state.current().to_string(),
            reconnect_attempts: self.reconnect_attempts(),
            endpoints: self.registry.endpoints(),
            sockets: self.registry.len(),
            loops: self.workers.active(),
        }
    }
}

/// Attempts made to bind an endpoint that a replaced socket just released.
const REBIND_ATTEMPTS: u32 = 10;
const REBIND_PAUSE: Duration = Duration::from_millis(10);

/// Binds `handle`. TCP listeners are torn down by the I/O thread after the
/// owning socket closes, so a rebind of an endpoint just `released` by a
/// replaced socket is retried briefly on `EADDRINUSE`.
fn bind_released(handle: &SocketHandle, endpoint: &str, released: bool) -> Result<()> {
    let mut attempt = 1;
    loop {
        match handle.bind(endpoint) {
            Err(TransferError::Bind {
                source: zmq::Error::EADDRINUSE,
                ..
            }) if released && attempt < REBIND_ATTEMPTS => {
                debug!(socket = handle.name(), endpoint, attempt, "Endpoint still in use, retrying bind");
                attempt += 1;
                std::thread::sleep(REBIND_PAUSE);
            }
            other => return other,
        }
    }
}
