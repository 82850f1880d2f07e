//! Relay Error Types
//!
//! Failures are split by blast radius: startup failures reach the caller of
//! `start`, session failures stay inside the session that produced them.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    /// The supplied relay configuration cannot be used
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),

    /// The listening socket could not be bound
    #[error("failed to bind listener on {addr}: {source}")]
    Startup {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `start` was called while a relay run is already in progress
    #[error("relay is already running")]
    AlreadyRunning,

    /// The outbound connection attempt failed
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The outbound connection attempt did not complete in time
    #[error("connection to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    /// A pump failed mid-copy
    #[error("{direction} transfer failed: {source}")]
    Transfer {
        direction: &'static str,
        #[source]
        source: io::Error,
    },

    /// A socket operation outside the copy loops failed
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// A relay task panicked or was aborted
    #[error("relay task failed: {0}")]
    Task(String),
}

impl RelayError {
    /// Whether this error belongs to a single session rather than the relay as a whole
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            RelayError::Connect { .. }
                | RelayError::ConnectTimeout { .. }
                | RelayError::Transfer { .. }
                | RelayError::Io(_)
        )
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(err: tokio::task::JoinError) -> Self {
        RelayError::Task(err.to_string())
    }
}
