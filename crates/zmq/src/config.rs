//! Configuration structures for the messaging client.
//!
//! All sections deserialize from TOML (or JSON via the parameter store) with
//! `#[serde(default)]`, so a partial file only overrides what it names. Every
//! section is validated with the `validator` crate before the client uses it.
//!
//! # Sections
//!
//! - [`ZmqParams`]: socket tuning, endpoints, reconnect policy, logging knobs
//!   and the payload format.
//! - [`NetworkParams`]: the pre-flight TCP reachability probe.
//! - [`BridgeParams`]: connection settings of the topic-bridge websocket client.
//! - [`PatternConfig`]: sockets to set up on `start()`.
//! - [`PublishTopicConfig`]: publish topics to register (and optionally loop).
//!
//! # Examples
//!
//! ```toml
//! [zmq]
//! host = "192.168.1.20"
//! port = 5555
//! message_format = "json"
//!
//! [[patterns]]
//! name = "telemetry"
//! kind = "pub_server"
//! endpoint = "tcp://*:5556"
//!
//! [[publish_topics]]
//! key = "odom"
//! topic = "/odom"
//! content = { x = 0.0, y = 0.0 }
//! frequency = 10.0
//! socket = "telemetry"
//! ```

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;
use validator::{Validate, ValidationError};

use crate::socket::{SocketPattern, SocketTuning};

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub zmq: ZmqParams,

    #[validate(nested)]
    pub network: NetworkParams,

    #[validate(nested)]
    pub bridge: BridgeParams,

    #[validate(nested)]
    pub patterns: Vec<PatternConfig>,

    #[validate(nested)]
    pub publish_topics: Vec<PublishTopicConfig>,
}

/// Messaging socket defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ZmqParams {
    /// Host used for client-role endpoints when none is given.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Port used for default endpoints.
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Overall deadline (seconds) for reachability retries to a remote host.
    #[validate(range(
        min = 0.1,
        max = 300.0,
        message = "Connection timeout must be between 0.1 and 300 seconds"
    ))]
    pub connection_timeout: f64,

    /// Pause (seconds) between reachability probes to a remote host.
    #[validate(range(min = 0.0, max = 60.0))]
    pub retry_interval: f64,

    /// Reachability probes attempted before a remote host is reported down.
    #[validate(range(max = 100))]
    pub max_retries: u32,

    /// ZMQ_LINGER in milliseconds; -1 waits forever on close.
    #[validate(range(min = -1, message = "Linger time must be -1 or greater"))]
    pub linger_time: i32,

    /// Applied to both ZMQ_SNDHWM and ZMQ_RCVHWM.
    #[validate(range(min = 0, message = "High water mark must not be negative"))]
    pub high_water_mark: i32,

    /// ZMQ_RCVTIMEO in milliseconds; values <= 0 leave the library default.
    pub receive_timeout: i32,

    /// ZMQ_SNDTIMEO in milliseconds; values <= 0 leave the library default.
    pub send_timeout: i32,

    pub auto_reconnect: bool,

    /// Seconds between connection attempts in `start()`.
    #[validate(range(min = 0.0, max = 3600.0))]
    pub reconnect_interval: f64,

    /// Retries after the first failed connection attempt.
    #[validate(range(max = 1000))]
    pub max_reconnect_attempts: u32,

    /// Promote per-message logs from TRACE to DEBUG.
    pub verbose: bool,

    /// Log bind/connect/close at INFO instead of DEBUG.
    pub show_connection_status: bool,

    /// Include message bodies in per-message logs.
    pub show_message_content: bool,

    /// Truncation length for logged message bodies.
    #[validate(range(min = 1, message = "Max message length must be at least 1"))]
    pub max_message_length: usize,

    /// Poll interval (seconds) of the binary's supervision loop.
    #[validate(range(min = 0.001, max = 60.0))]
    pub main_loop_sleep: f64,

    /// Sleep (seconds) of receive loops when no message is pending.
    #[validate(range(
        min = 0.0001,
        max = 10.0,
        message = "Message processing sleep must be between 0.0001 and 10 seconds"
    ))]
    pub message_processing_sleep: f64,

    pub message_format: MessageFormat,

    #[validate(custom(function = "validate_encoding"))]
    pub encoding: String,

    /// Carried for compatibility; frames are sent uncompressed.
    pub compression_enabled: bool,

    #[validate(range(
        min = 1,
        max = 9,
        message = "Compression level must be between 1 and 9"
    ))]
    pub compression_level: u32,
}

impl Default for ZmqParams {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5555,
            connection_timeout: 10.0,
            retry_interval: 1.0,
            max_retries: 3,
            linger_time: 1000,
            high_water_mark: 1000,
            receive_timeout: 5000,
            send_timeout: 5000,
            auto_reconnect: true,
            reconnect_interval: 5.0,
            max_reconnect_attempts: 5,
            verbose: false,
            show_connection_status: true,
            show_message_content: false,
            max_message_length: 200,
            main_loop_sleep: 0.1,
            message_processing_sleep: 0.01,
            message_format: MessageFormat::Json,
            encoding: "utf-8".into(),
            compression_enabled: false,
            compression_level: 6,
        }
    }
}

impl ZmqParams {
    /// Socket options applied at creation time.
    pub fn tuning(&self) -> SocketTuning {
        SocketTuning {
            linger_ms: self.linger_time,
            high_water_mark: self.high_water_mark,
            recv_timeout_ms: self.receive_timeout,
            send_timeout_ms: self.send_timeout,
        }
    }

    /// Default endpoint for a socket of the given pattern:
    /// `tcp://*:{port}` for server roles, `tcp://{host}:{port}` otherwise.
    pub fn default_endpoint(&self, pattern: SocketPattern) -> String {
        if pattern.is_server_role() {
            format!("tcp://*:{}", self.port)
        } else {
            format!("tcp://{}:{}", self.host, self.port)
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        secs(self.reconnect_interval)
    }

    pub fn retry_interval(&self) -> Duration {
        secs(self.retry_interval)
    }

    pub fn connection_timeout(&self) -> Duration {
        secs(self.connection_timeout)
    }

    pub fn main_loop_sleep(&self) -> Duration {
        secs(self.main_loop_sleep)
    }

    pub fn message_processing_sleep(&self) -> Duration {
        secs(self.message_processing_sleep)
    }
}

/// Network connectivity probe settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkParams {
    pub connectivity_check_enabled: bool,

    /// Probe timeout in seconds.
    #[validate(range(
        min = 0.01,
        max = 60.0,
        message = "Connectivity timeout must be between 0.01 and 60 seconds"
    ))]
    pub connectivity_timeout: f64,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            connectivity_check_enabled: true,
            connectivity_timeout: 3.0,
        }
    }
}

impl NetworkParams {
    pub fn connectivity_timeout(&self) -> Duration {
        secs(self.connectivity_timeout)
    }
}

/// Connection settings of the topic-bridge websocket client
/// ([`crate::bridge::BridgeClient`]).
///
/// Durations are in seconds. A zero `ping_interval` disables keepalive pings
/// and a zero `ping_timeout` stops waiting for their pongs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BridgeParams {
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    #[validate(custom(function = "validate_bridge_protocol"))]
    pub protocol: String,

    #[validate(range(min = 0.1, max = 300.0))]
    pub connection_timeout: f64,

    #[validate(range(min = 0.0, max = 60.0))]
    pub retry_interval: f64,

    pub max_retries: u32,

    #[validate(range(min = 0.0))]
    pub ping_interval: f64,

    #[validate(range(min = 0.0))]
    pub ping_timeout: f64,

    #[validate(range(min = 0.0))]
    pub close_timeout: f64,

    /// Largest accepted websocket message in bytes.
    #[validate(range(min = 1))]
    pub max_size: usize,

    pub auto_reconnect: bool,

    #[validate(range(min = 0.0, max = 3600.0))]
    pub reconnect_interval: f64,

    pub max_reconnect_attempts: u32,
}

impl Default for BridgeParams {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 9090,
            protocol: "ws".into(),
            connection_timeout: 10.0,
            retry_interval: 1.0,
            max_retries: 3,
            ping_interval: 20.0,
            ping_timeout: 10.0,
            close_timeout: 10.0,
            max_size: 1_048_576,
            auto_reconnect: true,
            reconnect_interval: 5.0,
            max_reconnect_attempts: 5,
        }
    }
}

impl BridgeParams {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        secs(self.connection_timeout)
    }

    pub fn retry_interval(&self) -> Duration {
        secs(self.retry_interval)
    }

    pub fn ping_interval(&self) -> Duration {
        secs(self.ping_interval)
    }

    pub fn ping_timeout(&self) -> Duration {
        secs(self.ping_timeout)
    }

    pub fn close_timeout(&self) -> Duration {
        secs(self.close_timeout)
    }

    pub fn reconnect_interval(&self) -> Duration {
        secs(self.reconnect_interval)
    }
}

/// Payload encoding used by `send_message` / `receive_message` and the loops.
///
/// Deserialization is lenient: unknown names fall back to [`MessageFormat::Json`]
/// with a warning instead of rejecting the whole configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    /// Structured text (JSON).
    #[default]
    Json,
    /// UTF-8 string.
    String,
    /// Raw bytes, passed through untouched.
    Bytes,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Json => "json",
            MessageFormat::String => "string",
            MessageFormat::Bytes => "bytes",
        }
    }

    /// Parses a format name, falling back to JSON for anything unknown.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(format = name, "Unknown message format, falling back to json");
            MessageFormat::Json
        })
    }
}

impl FromStr for MessageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(MessageFormat::Json),
            "string" | "str" | "text" => Ok(MessageFormat::String),
            "bytes" | "raw" => Ok(MessageFormat::Bytes),
            other => Err(format!("unsupported message format: {other}")),
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(MessageFormat::from_name(&name))
    }
}

/// A socket the client sets up on `start()`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PatternConfig {
    /// Pattern name used by `enable_pattern` / `register_handler`.
    #[validate(length(min = 1, message = "Pattern name must not be empty"))]
    pub name: String,

    pub kind: PatternKind,

    /// Endpoint override; defaults from [`ZmqParams::default_endpoint`].
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Registry name override; defaults to the pattern name.
    #[serde(default)]
    pub socket_name: Option<String>,

    /// Subscription filters (SUB only). Empty means everything.
    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PatternConfig {
    pub fn new(name: impl Into<String>, kind: PatternKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: None,
            socket_name: None,
            topics: Vec::new(),
            enabled: true,
        }
    }

    pub fn socket_name(&self) -> String {
        self.socket_name
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Role a configured pattern plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ReqClient,
    RepServer,
    PubServer,
    SubClient,
    PushClient,
    PullServer,
}

impl PatternKind {
    pub fn pattern(&self) -> SocketPattern {
        match self {
            PatternKind::ReqClient => SocketPattern::Request,
            PatternKind::RepServer => SocketPattern::Reply,
            PatternKind::PubServer => SocketPattern::Publish,
            PatternKind::SubClient => SocketPattern::Subscribe,
            PatternKind::PushClient => SocketPattern::Push,
            PatternKind::PullServer => SocketPattern::Pull,
        }
    }

    pub fn default_socket_name(&self) -> &'static str {
        match self {
            PatternKind::ReqClient => "req_client",
            PatternKind::RepServer => "rep_server",
            PatternKind::PubServer => "pub_server",
            PatternKind::SubClient => "sub_client",
            PatternKind::PushClient => "push_client",
            PatternKind::PullServer => "pull_server",
        }
    }
}

/// A publish topic registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PublishTopicConfig {
    #[validate(length(min = 1, message = "Topic key must not be empty"))]
    pub key: String,

    /// Wire topic name (frame 0).
    #[validate(length(min = 1, message = "Topic name must not be empty"))]
    pub topic: String,

    #[serde(default = "default_content")]
    pub content: Value,

    #[serde(default = "default_frequency")]
    #[validate(range(
        exclusive_min = 0.0,
        max = 10000.0,
        message = "Frequency must be above 0 and at most 10000 Hz"
    ))]
    pub frequency: f64,

    /// Publish socket to start a loop on; none means register only.
    #[serde(default)]
    pub socket: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_content() -> Value {
    Value::String("test".into())
}

fn default_frequency() -> f64 {
    1.0
}

fn validate_encoding(encoding: &str) -> Result<(), ValidationError> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => Ok(()),
        _ => Err(ValidationError::new("unsupported_encoding")
            .with_message("Only utf-8 encoding is supported".into())),
    }
}

fn validate_bridge_protocol(protocol: &str) -> Result<(), ValidationError> {
    match protocol {
        "ws" | "wss" => Ok(()),
        _ => Err(ValidationError::new("unsupported_protocol")
            .with_message("Bridge protocol must be ws or wss".into())),
    }
}

pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
