//! Configuration Manager

use super::{Config, MAX_BUFFER_SIZE};
use crate::Result;
use anyhow::{bail, Context};
use std::net::IpAddr;
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to the environment when it is missing
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            tracing::info!("Configuration loaded from {}", path.display());
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using environment",
                path.display()
            );
            Self::load_from_env()
        }
    }

    /// Load configuration from environment variables over built-in defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(port) = std::env::var("TCPRELAY_LISTEN_PORT") {
            config.relay.listen_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TCPRELAY_LISTEN_PORT: {}", port))?;
        }

        if let Ok(host) = std::env::var("TCPRELAY_TARGET_HOST") {
            config.relay.target_host = host;
        }

        if let Ok(port) = std::env::var("TCPRELAY_TARGET_PORT") {
            config.relay.target_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TCPRELAY_TARGET_PORT: {}", port))?;
        }

        if let Ok(bind_host) = std::env::var("TCPRELAY_BIND_HOST") {
            config.settings.bind_host = bind_host
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid TCPRELAY_BIND_HOST: {}", bind_host))?;
        }

        if let Ok(buffer_size) = std::env::var("TCPRELAY_BUFFER_SIZE") {
            config.settings.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(timeout) = std::env::var("TCPRELAY_CONNECT_TIMEOUT") {
            config.settings.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("TCPRELAY_SHUTDOWN_TIMEOUT") {
            config.settings.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPRELAY_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("TCPRELAY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.relay
            .validate()
            .context("Relay configuration validation failed")?;

        self.validate_settings()
            .context("Relay settings validation failed")?;

        self.validate_logging()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_settings(&self) -> Result<()> {
        if self.settings.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }

        if self.settings.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.settings.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_logging(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen_port: Option<u16>,
        target_host: Option<&str>,
        target_port: Option<u16>,
        bind: Option<&str>,
        buffer_size: Option<usize>,
    ) {
        if let Some(port) = listen_port {
            self.relay.listen_port = port;
            tracing::info!("CLI override: listen port set to {}", port);
        }

        if let Some(host) = target_host {
            self.relay.target_host = host.to_string();
            tracing::info!("CLI override: target host set to {}", host);
        }

        if let Some(port) = target_port {
            self.relay.target_port = port;
            tracing::info!("CLI override: target port set to {}", port);
        }

        if let Some(bind_str) = bind {
            if let Ok(ip) = bind_str.parse::<IpAddr>() {
                self.settings.bind_host = ip;
                tracing::info!("CLI override: bind host set to {}", ip);
            } else {
                tracing::warn!("Invalid bind host provided: {}", bind_str);
            }
        }

        if let Some(buffer_size) = buffer_size {
            self.settings.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }
    }
}
