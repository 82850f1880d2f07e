//! Integration tests for the relay controller lifecycle

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tcprelay::logsink::LogBuffer;
use tcprelay::{LivenessSignal, RelayConfig, RelayController, RelayError, RelaySettings, RelayState};

/// Counts liveness edges
#[derive(Default)]
struct LivenessCounter {
    active: AtomicUsize,
    inactive: AtomicUsize,
}

impl LivenessSignal for LivenessCounter {
    fn on_became_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn on_became_inactive(&self) {
        self.inactive.fetch_add(1, Ordering::SeqCst);
    }
}

impl LivenessCounter {
    fn edges(&self) -> (usize, usize) {
        (self.active.load(Ordering::SeqCst), self.inactive.load(Ordering::SeqCst))
    }
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

fn new_controller() -> (RelayController, LogBuffer, Arc<LivenessCounter>) {
    let log = LogBuffer::new();
    let liveness = Arc::new(LivenessCounter::default());
    let settings = RelaySettings {
        bind_host: "127.0.0.1".parse().unwrap(),
        shutdown_timeout: Duration::from_secs(2),
        ..RelaySettings::default()
    };
    let controller = RelayController::new(settings, Arc::new(log.clone()), liveness.clone());
    (controller, log, liveness)
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("socket was not closed in time");
    assert!(matches!(read, Ok(0) | Err(_)), "expected closed socket, got {:?}", read);
}

#[tokio::test]
async fn test_ping_scenario() {
    let target = spawn_echo_server().await;
    let (controller, log, liveness) = new_controller();

    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();
    assert_eq!(controller.state(), RelayState::Running);
    assert!(controller.is_active());
    assert_eq!(liveness.edges(), (1, 0));

    let mut client = TcpStream::connect(listen).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"PING");

    client.shutdown().await.unwrap();
    assert_closed(&mut client).await;
    assert!(wait_until(|| log.contains(|m| m.starts_with("Disconnected from"))).await);

    assert!(log.contains(|m| m.starts_with("Connection from")));
    assert!(log.contains(|m| m == "Client: 50 49 4E 47 (4 bytes)"));
    assert!(log.contains(|m| m == "Server: 50 49 4E 47 (4 bytes)"));

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), RelayState::Idle);
    assert_eq!(liveness.edges(), (1, 1));
    assert!(log.contains(|m| m == "Relay stopped"));
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let target = spawn_echo_server().await;
    let (controller, _log, liveness) = new_controller();

    let first = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();

    let second = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await;
    assert!(matches!(second, Err(RelayError::AlreadyRunning)));

    // Still exactly one listener, the first one
    assert_eq!(controller.local_addr(), Some(first));
    assert_eq!(liveness.edges(), (1, 0));
    assert!(TcpStream::connect(first).await.is_ok());

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_restart_works() {
    let target = spawn_echo_server().await;
    let (controller, _log, liveness) = new_controller();

    controller.stop().await.unwrap();
    assert_eq!(liveness.edges(), (0, 0));

    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();
    controller.stop().await.unwrap();
    controller.stop().await.unwrap();
    assert_eq!(liveness.edges(), (1, 1));
    assert!(controller.local_addr().is_none());
    assert!(TcpStream::connect(listen).await.is_err());

    // A new run takes a new config
    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();
    let mut client = TcpStream::connect(listen).await.unwrap();
    client.write_all(b"again").await.unwrap();
    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"again");

    controller.stop().await.unwrap();
    assert_eq!(liveness.edges(), (2, 2));
}

#[tokio::test]
async fn test_stop_closes_all_idle_sessions() {
    // Target accepts and holds every connection without reading or writing
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let (held_tx, mut held_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = held_tx.send(stream);
        }
    });

    let (controller, log, liveness) = new_controller();
    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();

    const SESSIONS: usize = 5;
    let mut clients = Vec::new();
    for _ in 0..SESSIONS {
        clients.push(TcpStream::connect(listen).await.unwrap());
    }
    let mut targets = Vec::new();
    for _ in 0..SESSIONS {
        targets.push(timeout(Duration::from_secs(2), held_rx.recv()).await.unwrap().unwrap());
    }
    assert!(wait_until(|| controller.active_session_count() == SESSIONS).await);

    // No idle timeout: silent peers keep their sessions open indefinitely
    sleep(Duration::from_millis(300)).await;
    assert_eq!(controller.active_session_count(), SESSIONS);
    assert_eq!(controller.active_session_stats().len(), SESSIONS);

    timeout(Duration::from_secs(5), controller.stop())
        .await
        .expect("stop did not finish in bounded time")
        .unwrap();

    assert_eq!(controller.active_session_count(), 0);
    assert_eq!(liveness.edges(), (1, 1));
    for client in clients.iter_mut() {
        assert_closed(client).await;
    }
    for target_side in targets.iter_mut() {
        assert_closed(target_side).await;
    }

    // Listener is gone as well
    assert!(TcpStream::connect(listen).await.is_err());
    assert!(!log.contains(|m| m.starts_with("Socket error")));
}

#[tokio::test]
async fn test_bind_failure_keeps_relay_idle() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let (controller, log, liveness) = new_controller();

    let result = controller
        .start(RelayConfig::new(port, "127.0.0.1", 9001))
        .await;

    assert!(matches!(result, Err(RelayError::Startup { .. })));
    assert_eq!(controller.state(), RelayState::Idle);
    assert_eq!(liveness.edges(), (0, 0));
    assert!(log.contains(|m| m.starts_with("Relay failed to start")));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (controller, _log, liveness) = new_controller();

    let result = controller.start(RelayConfig::new(0, "127.0.0.1", 9001)).await;
    assert!(matches!(result, Err(RelayError::InvalidConfig(_))));

    let result = controller.start(RelayConfig::new(9000, "", 9001)).await;
    assert!(matches!(result, Err(RelayError::InvalidConfig(_))));

    assert_eq!(controller.state(), RelayState::Idle);
    assert_eq!(liveness.edges(), (0, 0));
}

#[tokio::test]
async fn test_failed_session_does_not_affect_others() {
    // Target accepts exactly one connection, then stops listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            drop(listener);
            let (mut reader, mut writer) = stream.into_split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    });

    let (controller, log, _liveness) = new_controller();
    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();

    let mut healthy = TcpStream::connect(listen).await.unwrap();
    healthy.write_all(b"one").await.unwrap();
    let mut reply = [0u8; 3];
    timeout(Duration::from_secs(2), healthy.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"one");

    // Target no longer listens: this session fails and is closed promptly
    let mut doomed = TcpStream::connect(listen).await.unwrap();
    assert_closed(&mut doomed).await;
    assert!(wait_until(|| log.contains(|m| m.starts_with("Socket error"))).await);

    // The first session and the accept loop are untouched
    healthy.write_all(b"two").await.unwrap();
    timeout(Duration::from_secs(2), healthy.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"two");
    assert!(controller.is_active());
    assert_eq!(controller.active_session_count(), 1);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_stop_still_reaches_idle() {
    let target = spawn_echo_server().await;
    let (controller, log, liveness) = new_controller();
    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();

    // Poll stop exactly once, then abandon it
    let finished = tokio::select! {
        biased;
        result = controller.stop() => {
            result.unwrap();
            true
        }
        _ = std::future::ready(()) => false,
    };
    if !finished {
        assert_eq!(controller.state(), RelayState::Stopping);
    }

    timeout(Duration::from_secs(5), controller.stopped())
        .await
        .expect("relay never went idle");
    assert_eq!(controller.state(), RelayState::Idle);
    assert_eq!(liveness.edges(), (1, 1));
    assert!(log.contains(|m| m == "Relay stopped"));
    assert!(TcpStream::connect(listen).await.is_err());

    // Nothing left to stop
    controller.stop().await.unwrap();
    assert_eq!(liveness.edges(), (1, 1));

    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();
    assert!(TcpStream::connect(listen).await.is_ok());
    controller.stop().await.unwrap();
    assert_eq!(liveness.edges(), (2, 2));
}

#[tokio::test]
async fn test_dropping_running_controller_tears_down_relay() {
    let target = spawn_echo_server().await;
    let (controller, log, liveness) = new_controller();
    let listen = controller
        .start(RelayConfig::new(unused_port(), "127.0.0.1", target.port()))
        .await
        .unwrap();

    let mut client = TcpStream::connect(listen).await.unwrap();
    assert!(wait_until(|| controller.active_session_count() == 1).await);

    drop(controller);

    assert!(wait_until(|| liveness.edges() == (1, 1)).await);
    assert!(wait_until(|| log.contains(|m| m == "Relay stopped")).await);
    assert_closed(&mut client).await;
    assert!(TcpStream::connect(listen).await.is_err());

    // Exactly one inactive edge
    sleep(Duration::from_millis(100)).await;
    assert_eq!(liveness.edges(), (1, 1));
}
