//! Relay Controller
//!
//! The externally visible start/stop state machine:
//! `Idle -> Starting -> Running -> Stopping -> Idle`.
//!
//! The controller owns the relay server, its stop handle and the task
//! running the accept loop, and it alone drives the liveness signal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, RelaySettings};
use crate::error::RelayError;
use crate::liveness::LivenessSignal;
use crate::logsink::LogSink;
use crate::relay::{ConnectionStats, RelayEngine, SessionOutcome};
use crate::server::RelayServer;
use crate::shutdown::StopHandle;

/// Lifecycle state of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Everything owned by one relay run
struct ActiveRelay {
    run_id: u64,
    stop: StopHandle,
    engine: Arc<RelayEngine>,
    local_addr: SocketAddr,
    // Taken by the first `stop` that waits on it
    task: Option<JoinHandle<()>>,
}

struct Inner {
    state: RelayState,
    active: Option<ActiveRelay>,
}

struct Shared {
    inner: Mutex<Inner>,
    // Mirrors `Inner::state` for callers waiting on a transition
    state_tx: watch::Sender<RelayState>,
    log: Arc<dyn LogSink>,
    liveness: Arc<dyn LivenessSignal>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: RelayState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Tear down a run once its accept task is done.
    ///
    /// The accept task calls this itself, so teardown completes even when
    /// nobody is awaiting `stop`. Only the first call for a run acts.
    fn on_server_exit(&self, run_id: u64, result: Result<(), RelayError>) {
        let claimed = {
            let mut inner = self.lock();
            let owns_run = inner
                .active
                .as_ref()
                .is_some_and(|active| active.run_id == run_id);
            if owns_run {
                // Published once the edge has fired, see below
                inner.state = RelayState::Idle;
                inner.active.take()
            } else {
                None
            }
        };

        match (claimed, result) {
            (Some(_), Err(e)) => {
                warn!("Relay run {} ended unexpectedly: {}", run_id, e);
                self.liveness.on_became_inactive();
            }
            (Some(_), Ok(())) => {
                info!("Relay run {} ended", run_id);
                self.liveness.on_became_inactive();
                self.log.emit("Relay stopped".to_string());
            }
            (None, Err(e)) => {
                debug!("Relay run {} already torn down: {}", run_id, e);
                return;
            }
            (None, Ok(())) => {
                debug!("Relay run {} already torn down", run_id);
                return;
            }
        }

        // `stopped()` waiters wake only after the inactive edge
        let inner = self.lock();
        if inner.state == RelayState::Idle {
            self.state_tx.send_replace(RelayState::Idle);
        }
    }
}

/// Starts and stops the relay on behalf of a host process
pub struct RelayController {
    shared: Arc<Shared>,
    settings: RelaySettings,
    // Serialises start/stop so Starting and Stopping never overlap
    control: tokio::sync::Mutex<()>,
    next_run_id: AtomicU64,
}

impl RelayController {
    pub fn new(
        settings: RelaySettings,
        log: Arc<dyn LogSink>,
        liveness: Arc<dyn LivenessSignal>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: RelayState::Idle,
                    active: None,
                }),
                state_tx: watch::Sender::new(RelayState::Idle),
                log,
                liveness,
            }),
            settings,
            control: tokio::sync::Mutex::new(()),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Bind the listener and start relaying to the configured target.
    ///
    /// Returns the bound listen address. Rejected with
    /// [`RelayError::AlreadyRunning`] unless the relay is idle; a bind
    /// failure leaves the relay idle.
    pub async fn start(&self, config: RelayConfig) -> Result<SocketAddr, RelayError> {
        let _control = self.control.lock().await;

        {
            let mut inner = self.shared.lock();
            if inner.state != RelayState::Idle {
                warn!("Start requested while relay is {:?}", inner.state);
                self.shared.log.emit("Relay is already running".to_string());
                return Err(RelayError::AlreadyRunning);
            }
            config.validate()?;
            self.shared.set_state(&mut inner, RelayState::Starting);
        }

        let log = Arc::clone(&self.shared.log);
        let server = match RelayServer::bind(config.listen_port, &self.settings, Arc::clone(&log)).await {
            Ok(server) => server,
            Err(e) => {
                let mut inner = self.shared.lock();
                self.shared.set_state(&mut inner, RelayState::Idle);
                return Err(e);
            }
        };

        let local_addr = server.local_addr();
        let stop = server.stop_handle();
        let engine = Arc::new(RelayEngine::new(&config, &self.settings, log));
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);

        // The listener is bound, so the relay is live from here on
        self.shared.liveness.on_became_active();

        let mut inner = self.shared.lock();
        let shared = Arc::clone(&self.shared);
        let session_engine = Arc::clone(&engine);
        let task = tokio::spawn(async move {
            let result = server
                .run(move |stream, addr, shutdown| {
                    let engine = Arc::clone(&session_engine);
                    async move {
                        match engine.pair(stream, shutdown).await {
                            SessionOutcome::Completed { bytes_up, bytes_down } => {
                                debug!("Session from {} completed ({} up, {} down)",
                                       addr, bytes_up, bytes_down)
                            }
                            SessionOutcome::Failed(e) => debug!("Session from {} failed: {}", addr, e),
                            SessionOutcome::Shutdown => debug!("Session from {} stopped", addr),
                        }
                    }
                })
                .await;
            shared.on_server_exit(run_id, result);
        });

        self.shared.set_state(&mut inner, RelayState::Running);
        inner.active = Some(ActiveRelay {
            run_id,
            stop,
            engine,
            local_addr,
            task: Some(task),
        });

        info!("Relay run {} forwarding {} -> {}", run_id, local_addr, config.target());
        Ok(local_addr)
    }

    /// Stop accepting, close every live session and wait for all relay
    /// tasks to exit. A no-op when the relay is idle.
    ///
    /// Cancel safe: if the returned future is dropped part way, the accept
    /// task still finishes the teardown and the relay reaches `Idle`.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let _control = self.control.lock().await;

        let (run_id, task) = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            let Some(active) = inner.active.as_mut() else {
                debug!("Stop requested while relay is idle");
                return Ok(());
            };

            info!("Stopping relay run {} on {} ({} active sessions)",
                  active.run_id, active.local_addr, active.engine.active_session_count());
            active.stop.stop();
            let stopping = (active.run_id, active.task.take());
            self.shared.set_state(inner, RelayState::Stopping);
            stopping
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                // The accept task died before it could tear the run down
                error!("Relay run {} task failed: {}", run_id, e);
                let message = e.to_string();
                self.shared.on_server_exit(run_id, Err(RelayError::Task(message.clone())));
                return Err(RelayError::Task(message));
            }
        }

        // Already the case unless an earlier stop was cancelled mid-wait
        self.stopped().await;
        Ok(())
    }

    /// Resolve once the relay is idle, whether stopped or ended on its own
    pub async fn stopped(&self) {
        let mut state = self.shared.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = state.wait_for(|current| *current == RelayState::Idle).await;
    }

    pub fn state(&self) -> RelayState {
        self.shared.lock().state
    }

    /// Whether the relay currently owns a listening socket
    pub fn is_active(&self) -> bool {
        self.state() == RelayState::Running
    }

    /// Bound listen address of the current run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().active.as_ref().map(|active| active.local_addr)
    }

    pub fn active_session_count(&self) -> usize {
        self.shared
            .lock()
            .active
            .as_ref()
            .map_or(0, |active| active.engine.active_session_count())
    }

    /// Connection statistics of every live session
    pub fn active_session_stats(&self) -> Vec<ConnectionStats> {
        self.shared
            .lock()
            .active
            .as_ref()
            .map(|active| active.engine.get_active_session_stats())
            .unwrap_or_default()
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        // The accept task finishes teardown and flips the liveness signal
        if let Some(active) = self.shared.lock().active.as_ref() {
            active.stop.stop();
        }
    }
}
