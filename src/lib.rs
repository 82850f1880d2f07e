//! tcprelay Library
//!
//! Bidirectional TCP relay: listens on a local port and, for every inbound
//! connection, opens a new connection to a fixed target and splices bytes in
//! both directions until both sides are done.
//!
//! The host drives a [`RelayController`] with `start`/`stop`, receives
//! human-readable events through a [`LogSink`] and is told when the relay
//! becomes active or inactive through a [`LivenessSignal`].

pub mod config;
pub mod controller;
pub mod error;
pub mod liveness;
pub mod logsink;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use config::{Config, RelayConfig, RelaySettings};
pub use controller::{RelayController, RelayState};
pub use error::RelayError;
pub use liveness::LivenessSignal;
pub use logsink::{LogEvent, LogSink};
pub use server::RelayServer;

/// Common error type for configuration and the host binary
pub type Result<T> = anyhow::Result<T>;
