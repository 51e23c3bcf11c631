//! Tunnel lifecycle against an in-process echo upstream

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use dsi_harness::tunnel::{
    BoxedUpstream, CloseReason, PodConnector, PodRef, TunnelError, TunnelManager, TunnelOptions,
    TunnelState, TunnelTarget,
};

/// Echoes every byte back; fails new connections while `fail` is set
#[derive(Clone, Default)]
struct EchoConnector {
    fail: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl PodConnector for EchoConnector {
    async fn connect(&self, pod: &PodRef, _port: u16) -> Result<BoxedUpstream, TunnelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TunnelError::Connection {
                pod: pod.to_string(),
                reason: "pod deleted".to_string(),
            });
        }

        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(client))
    }
}

/// Never answers the handshake
struct StuckConnector;

#[async_trait]
impl PodConnector for StuckConnector {
    async fn connect(&self, _pod: &PodRef, _port: u16) -> Result<BoxedUpstream, TunnelError> {
        std::future::pending().await
    }
}

/// Answers the first handshake, then hands out upstreams that never reply
#[derive(Default)]
struct SilentAfterOpenConnector {
    connects: AtomicUsize,
    silent: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
}

#[async_trait]
impl PodConnector for SilentAfterOpenConnector {
    async fn connect(&self, _pod: &PodRef, _port: u16) -> Result<BoxedUpstream, TunnelError> {
        let (client, server) = tokio::io::duplex(4096);
        if self.connects.fetch_add(1, Ordering::SeqCst) > 0 {
            // keep the far end alive but never read or write it
            self.silent.lock().unwrap().push(server);
        }
        Ok(Box::new(client))
    }
}

/// Liveness checks are effectively off unless a test asks for them
fn options() -> TunnelOptions {
    TunnelOptions {
        ready_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_millis(500),
        close_timeout: Duration::from_secs(1),
        liveness_interval: Duration::from_secs(3600),
    }
}

fn manager(connector: EchoConnector) -> TunnelManager<EchoConnector> {
    TunnelManager::new(connector, "e2e", options())
}

#[tokio::test]
async fn test_echo_round_trip() {
    let manager = manager(EchoConnector::default());
    let mut tunnel = manager.open_pod("pg-0", 5432).await.unwrap();

    assert_eq!(tunnel.state(), TunnelState::Ready);
    assert_eq!(tunnel.pod(), &PodRef::new("e2e", "pg-0"));
    assert_eq!(tunnel.target_port(), 5432);
    assert!(tunnel.local_addr().ip().is_loopback());

    let mut stream = tunnel.connect().await.unwrap();
    stream.write_all(b"SELECT 1").await.unwrap();
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"SELECT 1");

    tunnel.close().await;
}

#[tokio::test]
async fn test_close_twice_then_use_fails() {
    let manager = manager(EchoConnector::default());
    let mut tunnel = manager.open_pod("pg-0", 5432).await.unwrap();
    let port = tunnel.local_port();

    tunnel.close().await;
    tunnel.close().await;

    assert_eq!(tunnel.state(), TunnelState::Closed(CloseReason::Requested));
    assert!(matches!(
        tunnel.connect().await,
        Err(TunnelError::ConnectionClosed { .. })
    ));
    assert!(matches!(
        tunnel.ensure_open(),
        Err(TunnelError::ConnectionClosed { .. })
    ));
    // the local port is released
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err());
}

#[tokio::test]
async fn test_close_unblocks_reader() {
    let manager = manager(EchoConnector::default());
    let mut tunnel = manager.open_pod("pg-0", 5432).await.unwrap();
    let mut stream = tunnel.connect().await.unwrap();

    // make sure the relay is up before closing
    stream.write_all(b"x").await.unwrap();
    let mut one = [0u8; 1];
    stream.read_exact(&mut one).await.unwrap();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        stream.read(&mut buf).await
    });

    tunnel.close().await;
    let read = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader still blocked after close")
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_handshake_failure_is_fatal_at_open() {
    let connector = EchoConnector::default();
    connector.fail.store(true, Ordering::SeqCst);
    let connects = Arc::clone(&connector.connects);

    let err = manager(connector).open_pod("pg-0", 5432).await.unwrap_err();
    assert!(matches!(err, TunnelError::Connection { .. }));
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handshake_is_bounded() {
    let manager = TunnelManager::new(StuckConnector, "e2e", options());
    let err = manager.open_pod("pg-0", 5432).await.unwrap_err();
    match err {
        TunnelError::Connection { reason, .. } => assert!(reason.contains("handshake")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_close_is_bounded_with_unresponsive_upstream() {
    let manager = TunnelManager::new(
        SilentAfterOpenConnector::default(),
        "e2e",
        TunnelOptions {
            handshake_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_millis(500),
            ..options()
        },
    );
    let mut tunnel = manager.open_pod("pg-0", 5432).await.unwrap();

    let mut stream = tunnel.connect().await.unwrap();
    stream.write_all(b"SELECT 1").await.unwrap();
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        stream.read(&mut buf).await
    });

    // let the relay reach the silent upstream
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    tunnel.close().await;
    assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_millis(250));
    assert_eq!(tunnel.state(), TunnelState::Closed(CloseReason::Requested));

    let read = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader still blocked after close")
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_vanished_pod_closes_idle_tunnel() {
    let connector = EchoConnector::default();
    let fail = Arc::clone(&connector.fail);
    let manager = TunnelManager::new(
        connector,
        "e2e",
        TunnelOptions {
            liveness_interval: Duration::from_millis(100),
            ..options()
        },
    );
    let tunnel = manager.open_pod("pg-0", 5432).await.unwrap();
    assert!(tunnel.is_open());

    fail.store(true, Ordering::SeqCst);

    match tunnel.wait_closed(Duration::from_secs(2)).await {
        Some(CloseReason::Failed(reason)) => assert!(reason.contains("pod deleted")),
        other => panic!("unexpected close: {:?}", other),
    }
    assert!(!tunnel.is_open());
    assert!(matches!(
        tunnel.connect().await,
        Err(TunnelError::ConnectionClosed { .. })
    ));
}

#[tokio::test]
async fn test_failed_relay_handshake_closes_tunnel() {
    let connector = EchoConnector::default();
    let fail = Arc::clone(&connector.fail);
    let tunnel = manager(connector).open_pod("pg-0", 5432).await.unwrap();

    fail.store(true, Ordering::SeqCst);
    let _stream = tunnel.connect().await.unwrap();

    match tunnel.wait_closed(Duration::from_secs(2)).await {
        Some(CloseReason::Failed(reason)) => assert!(reason.contains("pod deleted")),
        other => panic!("unexpected close: {:?}", other),
    }
    assert!(!tunnel.is_open());
    assert!(matches!(
        tunnel.connect().await,
        Err(TunnelError::ConnectionClosed { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_opens_are_independent() {
    let connector = EchoConnector::default();
    let manager = manager(connector);

    let (a, b) = tokio::join!(
        manager.open_pod("pg-0", 5432),
        manager.open_pod("pg-1", 5432)
    );
    let (mut a, mut b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.local_port(), b.local_port());

    a.close().await;
    assert!(b.is_open());

    let mut stream = b.connect().await.unwrap();
    stream.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
    b.close().await;
}

#[tokio::test]
async fn test_rejects_port_zero() {
    let err = manager(EchoConnector::default())
        .open_pod("pg-0", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::InvalidPort(0)));
}

#[tokio::test]
async fn test_unresolvable_selector() {
    let err = manager(EchoConnector::default())
        .open(TunnelTarget::selector("a8s.a9s/replication-role=master"), 5432)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::NoPodsFound(_)));
}

#[tokio::test]
async fn test_drop_releases_port() {
    let manager = manager(EchoConnector::default());
    let tunnel = manager.open_pod("pg-0", 5432).await.unwrap();
    let port = tunnel.local_port();
    drop(tunnel);

    // the aborted loop drops its listener on the next scheduler turn
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err());
}
