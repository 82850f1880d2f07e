//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::RelayError;

/// Default chunk size used by the byte pumps
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Largest accepted chunk size
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub relay: RelayConfig,
    #[serde(default)]
    pub settings: RelaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where to listen and where to forward.
///
/// Immutable for the lifetime of one relay run; a new run takes a new config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

/// Tunables shared by every relay run
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySettings {
    pub bind_host: IpAddr,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Diagnostic logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl RelayConfig {
    pub fn new(listen_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            listen_port,
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Check the invariants a relay run depends on
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.listen_port == 0 {
            return Err(RelayError::InvalidConfig(
                "listen_port must be greater than 0".to_string(),
            ));
        }

        if self.target_port == 0 {
            return Err(RelayError::InvalidConfig(
                "target_port must be greater than 0".to_string(),
            ));
        }

        let host = self.target_host.trim();
        if host.is_empty() {
            return Err(RelayError::InvalidConfig(
                "target_host must not be empty".to_string(),
            ));
        }

        if host.len() != self.target_host.len() || host.chars().any(char::is_whitespace) {
            return Err(RelayError::InvalidConfig(format!(
                "target_host contains whitespace: {:?}",
                self.target_host
            )));
        }

        Ok(())
    }

    /// The `host:port` string the pairing step dials
    pub fn target(&self) -> String {
        if self.target_host.contains(':') && !self.target_host.starts_with('[') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }
}

impl RelaySettings {
    /// Address the listening socket binds to for a given port
    pub fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_host, port)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
