//! Liveness Signal
//!
//! Hooks the host uses to keep a keep-alive indicator up exactly while the
//! relay owns its listening socket.

use tracing::info;

/// Start/stop edges of the relay's active period
pub trait LivenessSignal: Send + Sync {
    fn on_became_active(&self);
    fn on_became_inactive(&self);
}

/// Liveness signal that reports edges through `tracing`
#[derive(Debug, Clone)]
pub struct LoggingLiveness {
    name: String,
}

impl LoggingLiveness {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl LivenessSignal for LoggingLiveness {
    fn on_became_active(&self) {
        info!("{} is running", self.name);
    }

    fn on_became_inactive(&self) {
        info!("{} is no longer running", self.name);
    }
}
