//! tcprelay - Bidirectional TCP port forwarder
//!
//! Listens on a local port and forwards every connection to a fixed
//! target, printing each relayed chunk as hex.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcprelay::{
    config::ConfigManager,
    liveness::LoggingLiveness,
    logsink::{ChannelLogSink, LogEvent},
    shutdown, RelayController,
};

/// CLI arguments for tcprelay
#[derive(Parser, Debug)]
#[command(name = "tcprelay")]
#[command(about = "tcprelay - Bidirectional TCP port forwarder")]
#[command(version)]
#[command(long_about = "
tcprelay - Bidirectional TCP port forwarder

Accepts connections on a local port and relays each one to a fixed
target host and port, logging every chunk in both directions.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPRELAY_LISTEN_PORT       - Local port to accept connections on
  TCPRELAY_TARGET_HOST       - Host to forward to (IPv4 address or hostname)
  TCPRELAY_TARGET_PORT       - Port to forward to
  TCPRELAY_BIND_HOST         - Local address to bind (default 0.0.0.0)
  TCPRELAY_BUFFER_SIZE       - Relay chunk size in bytes
  TCPRELAY_CONNECT_TIMEOUT   - Outbound connect timeout (e.g. 10s)
  TCPRELAY_SHUTDOWN_TIMEOUT  - Time allowed for sessions to close on stop
  TCPRELAY_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "tcprelay.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Local port to listen on (overrides config file)
    #[arg(short, long, help = "Local port to listen on")]
    pub listen_port: Option<u16>,

    /// Target host (overrides config file)
    #[arg(short, long, help = "Target host to forward to")]
    pub target_host: Option<String>,

    /// Target port (overrides config file)
    #[arg(short = 'p', long, help = "Target port to forward to")]
    pub target_port: Option<u16>,

    /// Local bind address (overrides config file)
    #[arg(short, long, help = "Local address to bind (e.g., 127.0.0.1)")]
    pub bind: Option<String>,

    /// Buffer size in bytes
    #[arg(long, help = "Relay chunk size in bytes")]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = ConfigManager::load_from_file(&args.config)?;
    config.merge_with_cli_args(
        args.listen_port,
        args.target_host.as_deref(),
        args.target_port,
        args.bind.as_deref(),
        args.buffer_size,
    );
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_tracing(&args, &config.logging.level)?;

    info!("Starting tcprelay v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen: {}", config.settings.listen_addr(config.relay.listen_port));
        info!("  Target: {}", config.relay.target());
        info!("  Buffer size: {} bytes", config.settings.buffer_size);
        info!("  Connect timeout: {:?}", config.settings.connect_timeout);
        info!("  Shutdown timeout: {:?}", config.settings.shutdown_timeout);
        return Ok(());
    }

    let (log_sink, events) = ChannelLogSink::new();
    let printer = tokio::spawn(print_events(events));

    let controller = RelayController::new(
        config.settings.clone(),
        Arc::new(log_sink),
        Arc::new(LoggingLiveness::new("TCP relay")),
    );

    let local_addr = controller
        .start(config.relay.clone())
        .await
        .context("Failed to start relay")?;
    info!("Relaying {} -> {}", local_addr, config.relay.target());
    info!("Press Ctrl+C or send SIGTERM/SIGINT to stop");

    let ended_on_its_own = tokio::select! {
        signal = shutdown::listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
            }
            if let Err(e) = controller.stop().await {
                error!("Error while stopping relay: {}", e);
            }
            false
        }
        _ = controller.stopped() => {
            error!("Relay stopped without a shutdown request");
            true
        }
    };

    // Dropping the controller drops the last sink, which ends the printer
    drop(controller);
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    if ended_on_its_own {
        bail!("Relay on {} ended unexpectedly", local_addr);
    }

    info!("Relay shutdown complete");
    Ok(())
}

/// Print relay events with their timestamps until every sink is gone
async fn print_events(mut events: mpsc::UnboundedReceiver<LogEvent>) {
    while let Some(event) = events.recv().await {
        println!(
            "[{}] {}",
            humantime::format_rfc3339_millis(event.timestamp),
            event.message
        );
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
