//! Relay Engine
//!
//! Pairs each inbound connection with a fresh outbound connection and runs
//! one pump per direction until both are done.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::pump::{pump, Direction, PumpOutcome};
use super::session::{ConnectionStats, RelaySession, SessionState};
use crate::config::{RelayConfig, RelaySettings};
use crate::error::RelayError;
use crate::logsink::LogSink;
use crate::shutdown::stop_requested;

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Both directions reached end-of-stream
    Completed { bytes_up: u64, bytes_down: u64 },
    /// Connect failure or mid-copy I/O error, isolated to this session
    Failed(RelayError),
    /// The relay was stopped while this session was live
    Shutdown,
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }
}

/// Handles connection pairing and tracks live sessions
pub struct RelayEngine {
    target: String,
    buffer_size: usize,
    connect_timeout: Duration,
    log: Arc<dyn LogSink>,
    active_sessions: Mutex<HashMap<String, Arc<RelaySession>>>,
    next_session_id: AtomicUsize,
}

impl RelayEngine {
    /// Create a relay engine forwarding to the config's target
    pub fn new(config: &RelayConfig, settings: &RelaySettings, log: Arc<dyn LogSink>) -> Self {
        Self {
            target: config.target(),
            buffer_size: settings.buffer_size,
            connect_timeout: settings.connect_timeout,
            log,
            active_sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicUsize::new(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<RelaySession>>> {
        self.active_sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the outbound connection. One attempt, no retry.
    pub async fn connect_to_target(&self) -> Result<TcpStream, RelayError> {
        debug!("Connecting to target {}", self.target);

        match timeout(self.connect_timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on outbound socket: {}", e);
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(RelayError::Connect {
                target: self.target.clone(),
                source,
            }),
            Err(_) => Err(RelayError::ConnectTimeout {
                target: self.target.clone(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Relay one inbound connection until both directions finish or the
    /// relay is stopped. Errors are logged here and never escape.
    pub async fn pair(&self, inbound: TcpStream, mut shutdown: watch::Receiver<bool>) -> SessionOutcome {
        let peer = match inbound.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.log.emit(format!("Socket error: {}", e));
                warn!("Inbound connection lost before pairing: {}", e);
                return SessionOutcome::Failed(RelayError::Io(e));
            }
        };

        self.log.emit(format!("Connection from {}", peer));

        let connected = tokio::select! {
            result = self.connect_to_target() => result,
            _ = stop_requested(&mut shutdown) => {
                debug!("Relay stopped while {} was waiting for the target", peer);
                drop(inbound);
                self.log.emit(format!("Disconnected from {}", peer));
                return SessionOutcome::Shutdown;
            }
        };

        let outbound = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Session from {} failed: {}", peer, e);
                self.log.emit(format!("Socket error: {}", e));
                drop(inbound);
                self.log.emit(format!("Disconnected from {}", peer));
                return SessionOutcome::Failed(e);
            }
        };

        let target_addr = match outbound.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Outbound connection for {} lost before relaying: {}", peer, e);
                self.log.emit(format!("Socket error: {}", e));
                self.log.emit(format!("Disconnected from {}", peer));
                return SessionOutcome::Failed(RelayError::Io(e));
            }
        };

        let session = self.register_session(peer, target_addr);
        let outcome = self.relay_data(&session, inbound, outbound, &mut shutdown).await;

        self.remove_session(&session.session_id);
        session.log_stats();
        self.log.emit(format!("Disconnected from {}", peer));

        outcome
    }

    fn register_session(&self, client_addr: SocketAddr, target_addr: SocketAddr) -> Arc<RelaySession> {
        let session_id = format!(
            "session-{}",
            self.next_session_id.fetch_add(1, Ordering::Relaxed)
        );
        let session = Arc::new(RelaySession::new(session_id.clone(), client_addr, target_addr));
        self.sessions().insert(session_id, Arc::clone(&session));

        info!("Started relay session {} from {} to {}",
              session.session_id, client_addr, target_addr);
        session
    }

    /// Run both pumps to completion (a join, not a race), or until shutdown.
    async fn relay_data(
        &self,
        session: &RelaySession,
        inbound: TcpStream,
        outbound: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionOutcome {
        let (mut client_read, mut client_write) = inbound.into_split();
        let (mut target_read, mut target_write) = outbound.into_split();
        let log = self.log.as_ref();

        let upstream = pump(
            &mut client_read,
            &mut target_write,
            Direction::Upstream,
            log,
            self.buffer_size,
            &session.bytes_up,
        );
        let downstream = pump(
            &mut target_read,
            &mut client_write,
            Direction::Downstream,
            log,
            self.buffer_size,
            &session.bytes_down,
        );

        let outcome = tokio::select! {
            (up, down) = async { tokio::join!(upstream, downstream) } => {
                session.finish(SessionState::Closed);
                self.settle(session, up, down)
            }
            _ = stop_requested(shutdown) => {
                session.finish(SessionState::Aborted);
                info!("Session {} closed by relay shutdown", session.session_id);
                SessionOutcome::Shutdown
            }
        };

        // Dropping every half closes both sockets, including any pump
        // cancelled mid-read or mid-write above
        drop((client_read, client_write, target_read, target_write));

        outcome
    }

    fn settle(&self, session: &RelaySession, up: PumpOutcome, down: PumpOutcome) -> SessionOutcome {
        let mut first_error = None;

        for outcome in [up, down] {
            if let Some(e) = outcome.error {
                warn!("Session {} {} pump failed after {} bytes: {}",
                      session.session_id, outcome.direction, outcome.bytes_transferred, e);
                self.log.emit(format!("Socket error: {}", e));
                if first_error.is_none() {
                    first_error = Some(RelayError::Transfer {
                        direction: outcome.direction.label(),
                        source: e,
                    });
                }
            }
        }

        match first_error {
            Some(e) => SessionOutcome::Failed(e),
            None => SessionOutcome::Completed {
                bytes_up: session.bytes_up(),
                bytes_down: session.bytes_down(),
            },
        }
    }

    /// Remove a session from active tracking
    pub fn remove_session(&self, session_id: &str) {
        if self.sessions().remove(session_id).is_some() {
            debug!("Removed session {} from active tracking", session_id);
        }
    }

    /// Get all active sessions
    pub fn get_active_sessions(&self) -> Vec<Arc<RelaySession>> {
        self.sessions().values().cloned().collect()
    }

    /// Get active session count
    pub fn active_session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Get session by ID
    pub fn get_session(&self, session_id: &str) -> Option<Arc<RelaySession>> {
        self.sessions().get(session_id).cloned()
    }

    /// Get connection statistics for all active sessions
    pub fn get_active_session_stats(&self) -> Vec<ConnectionStats> {
        self.sessions().values().map(|session| session.to_stats()).collect()
    }
}
