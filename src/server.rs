//! Relay Server
//!
//! Owns the listening socket and the accept loop. Every accepted connection
//! is handed to a session handler on its own task, so a stalled peer never
//! holds up the next accept.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::error::RelayError;
use crate::logsink::LogSink;
use crate::shutdown::{stop_requested, StopHandle};

/// A bound relay listener ready to run its accept loop
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: StopHandle,
    log: Arc<dyn LogSink>,
    shutdown_timeout: Duration,
}

/// Pause before accepting again once the process is out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// errno values for the per-process and system-wide descriptor limits
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// Accept errors that concern one pending connection rather than the listener
fn is_recoverable_accept_error(err: &io::Error) -> bool {
    is_descriptor_exhaustion(err)
        || matches!(
            err.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
        )
}

/// The descriptor limit was hit; it clears as live sessions close
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    cfg!(unix) && matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

impl RelayServer {
    /// Bind the listening socket. A failure here is fatal to the relay run.
    pub async fn bind(
        listen_port: u16,
        settings: &RelaySettings,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, RelayError> {
        let bind_addr = settings.listen_addr(listen_port);
        log.emit(format!("Starting relay on port {}", listen_port));

        info!("Binding TCP listener to {}", bind_addr);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!("Failed to bind {}: {}", bind_addr, source);
                log.emit(format!("Relay failed to start: {}", source));
                return Err(RelayError::Startup {
                    addr: bind_addr,
                    source,
                });
            }
        };

        let local_addr = listener.local_addr().map_err(|source| RelayError::Startup {
            addr: bind_addr,
            source,
        })?;

        info!("Successfully bound to {}", local_addr);
        log.emit(format!("Relay started on {}", local_addr));

        Ok(Self {
            listener,
            local_addr,
            stop: StopHandle::new(),
            log,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops this server's accept loop and every session it spawned
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Accept connections until stopped or a fatal accept error occurs.
    ///
    /// `on_session` gets the accepted stream, its peer address and a stop
    /// receiver; the future it returns runs on its own task. Before
    /// returning, the listener is closed, all sessions are told to stop and
    /// are waited for (up to the shutdown timeout, then aborted).
    pub async fn run<F, Fut>(self, on_session: F) -> Result<(), RelayError>
    where
        F: Fn(TcpStream, SocketAddr, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let RelayServer {
            listener,
            local_addr,
            stop,
            log,
            shutdown_timeout,
        } = self;

        info!("Starting connection acceptance loop on {}", local_addr);
        let mut shutdown = stop.subscribe();
        let mut sessions = JoinSet::new();

        let result = loop {
            if stop.is_stopped() {
                break Ok(());
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            if stop.is_stopped() {
                                debug!("Rejecting connection from {} due to shutdown", addr);
                                break Ok(());
                            }

                            debug!("Accepted connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            sessions.spawn(on_session(stream, addr, stop.subscribe()));
                        }
                        Err(e) if is_recoverable_accept_error(&e) => {
                            warn!("Error accepting connection: {}", e);
                            if is_descriptor_exhaustion(&e) {
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                        }
                        Err(e) => {
                            error!("Fatal accept error on {}: {}", local_addr, e);
                            log.emit(format!("Relay stopped: {}", e));
                            break Err(RelayError::Io(e));
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Session task panicked: {}", e);
                        }
                    }
                }
                _ = stop_requested(&mut shutdown) => {
                    info!("Received stop signal, stopping connection acceptance");
                    break Ok(());
                }
            }
        };

        drop(listener);
        info!("Listener on {} closed", local_addr);

        // Sessions outlive a fatal accept error only until here
        stop.stop();
        drain_sessions(&mut sessions, shutdown_timeout).await;

        info!("Connection acceptance loop stopped");
        result
    }
}

async fn drain_sessions(sessions: &mut JoinSet<()>, shutdown_timeout: Duration) {
    if sessions.is_empty() {
        return;
    }

    info!("Waiting for {} sessions to close (timeout: {:?})", sessions.len(), shutdown_timeout);
    let drained = timeout(shutdown_timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!("Shutdown timeout reached with {} sessions still running, aborting them",
              sessions.len());
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}
