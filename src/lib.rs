//! lbros: ZeroMQ messaging runtime
//!
//! Runs an [`lbros_zmq::ZmqClient`] as a long-lived service: the sockets,
//! publish topics and reconnection behavior all come from one TOML file, and
//! the process shuts down cleanly on Ctrl+C.
//!
//! ## Modules
//!
//! * `config`: Configuration loading and validation. The `[client]` table is
//!   passed to the messaging client unchanged.
//!
//! * `core`: Readiness tracking derived from the client's connection state.
//!
//! * `logger`: `tracing` initialization with console output (compact,
//!   pretty or JSON) and optional systemd journald integration.

pub mod config;
pub mod core;
pub mod logger;
