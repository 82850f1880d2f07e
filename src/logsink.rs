//! Relay Event Log
//!
//! Human-readable event lines emitted by the relay core. Sinks are
//! fire-and-forget: `emit` never blocks the relay and never fails it.

use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// One human-readable relay event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: SystemTime,
    pub message: String,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            message: message.into(),
        }
    }
}

/// Append-only consumer of relay events.
///
/// Called concurrently from every session; implementations must return
/// promptly and swallow their own failures.
pub trait LogSink: Send + Sync {
    fn emit(&self, message: String);
}

/// Host-owned in-memory event list
#[derive(Debug, Default, Clone)]
pub struct LogBuffer {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEvent>> {
        // A panicking writer cannot leave a Vec half-pushed
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of every event recorded so far
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.lock().clone()
    }

    /// Messages only, in append order
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any recorded message satisfies `pred`
    pub fn contains<F>(&self, pred: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.lock().iter().any(|e| pred(&e.message))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl LogSink for LogBuffer {
    fn emit(&self, message: String) {
        self.lock().push(LogEvent::new(message));
    }
}

/// Sink feeding an unbounded channel drained by the host
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelLogSink {
    /// Create a sink and the receiver the host drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLogSink {
    fn emit(&self, message: String) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(LogEvent::new(message));
    }
}

/// Sink forwarding events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, message: String) {
        tracing::info!(target: "tcprelay::events", "{}", message);
    }
}

/// Render bytes as uppercase hex pairs separated by single spaces
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        // Writing into a String cannot fail
        let _ = write!(out, "{:02X}", byte);
    }
    out
}
