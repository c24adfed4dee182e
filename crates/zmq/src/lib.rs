//! # lbros-zmq: multi-pattern ZeroMQ client
//!
//! A messaging client that manages named ZeroMQ sockets of every basic
//! pattern and drives them from background tokio tasks:
//!
//! - **Socket registry** mapping logical names to tuned REQ, REP, PUB, SUB,
//!   PUSH and PULL sockets
//! - **Bridge framing**: the three-frame `[topic, length, payload]` layout
//!   used by the robotics middleware bridge
//! - **Pattern loops** for publishing at a fixed rate, subscribing with a
//!   callback, and serving requests
//! - **Bounded reconnection** around the initial connection sequence
//! - **Runtime parameters** that can be read and changed while running
//! - **Topic bridge client** speaking the bridge's JSON operations over a
//!   websocket
//!
//! # Quick Start
//!
//! ```ignore
//! use lbros_zmq::{Config, SubscriberCallback, ZmqClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ZmqClient::new(Config::default())?;
//!
//!     client.create_publish_server(Some("tcp://*:5556"), None)?;
//!     client.add_publish_topic("chatter", "/chatter", "hello", 10.0)?;
//!     client.start_publish_loop("pub_server", "chatter")?;
//!
//!     client.create_subscribe_client(Some("tcp://127.0.0.1:5556"), None, &["/chatter".into()])?;
//!     client.start_subscriber_loop(
//!         "sub_client",
//!         SubscriberCallback::with_topic(|topic, payload| {
//!             println!("{topic}: {payload}");
//!             Ok(())
//!         }),
//!     )?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Wire Format
//!
//! Publish loops send every message as three frames:
//!
//! ```text
//! frame 0: topic name (UTF-8)
//! frame 1: u32 LE = len(frame 2)
//! frame 2: u32 LE = len(content) ++ content (UTF-8)
//! ```
//!
//! Subscriber loops accept that layout as well as plain one- and two-frame
//! messages. See [`loops::resolve_frames`].
//!
//! # Concurrency
//!
//! Every loop is a tokio task with its own cancellation token. Receives and
//! loop sends never block; the sleep between ticks is the only suspension
//! point. `stop()` cancels all loops, waits up to one second for each, aborts
//! the rest and closes every socket.

pub mod backoff;
pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod frequency;
pub mod loops;
pub mod params;
pub mod registry;
pub mod socket;
pub mod state;
pub mod topics;

// Re-exports: Client facade
pub use bridge::BridgeClient;
pub use client::{ClientStatus, RemoteHost, ZmqClient, LOOP_JOIN_TIMEOUT};
// Re-exports: Configuration
//
// Config is embedded in the application's own configuration file
pub use config::{
    BridgeParams, Config, MessageFormat, NetworkParams, PatternConfig, PatternKind,
    PublishTopicConfig, ZmqParams,
};
// Re-exports: Codec
pub use codec::{FrameMessage, Payload};
// Re-exports: Error handling
pub use error::TransferError;
// Re-exports: Loops and callbacks
pub use loops::{
    CallbackError, ContentGenerator, RequestHandler, ShutdownReport, SubscribeOptions,
    SubscriberCallback,
};
// Re-exports: Parameters, sockets, state
pub use params::{ParamStore, Section};
pub use socket::{SocketHandle, SocketPattern, SocketTuning};
pub use state::ConnectionState;

/// Result alias used by every fallible operation in this crate.
///
/// ```ignore
/// fn announce(client: &lbros_zmq::ZmqClient) -> lbros_zmq::Result<()> {
///     client.publish_frames("pub_server", "/status", "online")?;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, TransferError>;
