//! Shutdown Handling
//!
//! Stop signalling for one relay run, plus the OS signal listener the
//! binary uses to stop the relay on SIGTERM/SIGINT.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::Result;

/// Stop signal shared by the accept loop and every session of one relay run.
///
/// Backed by a `watch` channel so a session subscribed after the stop was
/// issued still observes it.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Get a receiver for tasks that must end when the relay stops
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Ask every subscriber to stop. Idempotent.
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            debug!("Stop signal issued");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once a stop has been issued on `shutdown`.
///
/// A dropped sender counts as a stop: nobody is left to own the task.
pub async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Wait for SIGTERM, SIGINT or Ctrl+C
pub async fn listen_for_signals() -> Result<()> {
    info!("Starting shutdown signal listener");

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping relay");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, stopping relay");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, stopping relay");
    }

    Ok(())
}
