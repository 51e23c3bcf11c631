//! Tunnel lifecycle: open, forward, close
//!
//! Each [`Tunnel`] owns one loopback listener and one background forwarding
//! loop. Every accepted local connection gets its own upstream stream from
//! the [`PodConnector`]; nothing is shared between tunnels.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, trace, warn};

use super::connector::{KubeConnector, PodConnector, PodRef, TunnelTarget};
use super::TunnelError;
use crate::poll::CancelToken;

/// Lifecycle of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    Ready,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close` was called or the handle was dropped
    Requested,
    /// The forwarding loop died on its own
    Failed(String),
}

/// Deadlines applied by a [`TunnelManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelOptions {
    /// How long `open` waits for the forwarding loop to report ready
    pub ready_timeout: Duration,
    /// Bound on every upstream handshake, including the one done by `open`
    pub handshake_timeout: Duration,
    /// How long `close` waits for the loop before aborting it
    pub close_timeout: Duration,
    /// Period of the upstream handshake that detects a vanished pod
    pub liveness_interval: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(5),
        }
    }
}

/// Opens tunnels into pods of one namespace
pub struct TunnelManager<C = KubeConnector> {
    connector: Arc<C>,
    namespace: String,
    options: TunnelOptions,
}

impl TunnelManager<KubeConnector> {
    pub fn from_client(client: Client, namespace: &str, options: TunnelOptions) -> Self {
        Self::new(KubeConnector::new(client), namespace, options)
    }
}

impl<C: PodConnector> TunnelManager<C> {
    pub fn new(connector: C, namespace: &str, options: TunnelOptions) -> Self {
        Self {
            connector: Arc::new(connector),
            namespace: namespace.to_string(),
            options,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn options(&self) -> TunnelOptions {
        self.options
    }

    /// Open a tunnel to `target_port` in the pod named `pod`
    pub async fn open_pod(&self, pod: &str, target_port: u16) -> Result<Tunnel, TunnelError> {
        self.open(TunnelTarget::pod(pod), target_port).await
    }

    /// Open a tunnel and wait until its local port accepts connections.
    ///
    /// The upstream handshake is attempted once up front so an unreachable
    /// pod fails here with [`TunnelError::Connection`] instead of on first use.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn open(&self, target: TunnelTarget, target_port: u16) -> Result<Tunnel, TunnelError> {
        if target_port == 0 {
            return Err(TunnelError::InvalidPort(target_port));
        }

        let opts = self.options;
        let pod = tokio::time::timeout(
            opts.handshake_timeout,
            self.connector.resolve(&self.namespace, &target),
        )
        .await
        .map_err(|_| TunnelError::Connection {
            pod: format!("{:?}", target),
            reason: format!("pod lookup exceeded {:?}", opts.handshake_timeout),
        })??;

        handshake(self.connector.as_ref(), &pod, target_port, opts.handshake_timeout).await?;

        let (state_tx, _) = watch::channel(TunnelState::Pending);
        let state = Arc::new(state_tx);
        let shutdown = CancelToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(forward_loop(
            Arc::clone(&self.connector),
            pod.clone(),
            target_port,
            opts,
            Arc::clone(&state),
            shutdown.clone(),
            ready_tx,
        ));

        let local_addr = match tokio::time::timeout(opts.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(addr))) => addr,
            Ok(Ok(Err(e))) => {
                return Err(TunnelError::Connection {
                    pod: pod.to_string(),
                    reason: format!("failed to bind local listener: {}", e),
                })
            }
            Ok(Err(_)) => {
                return Err(TunnelError::Connection {
                    pod: pod.to_string(),
                    reason: "forwarding loop exited before becoming ready".to_string(),
                })
            }
            Err(_) => {
                task.abort();
                return Err(TunnelError::ReadinessTimeout {
                    pod: pod.to_string(),
                    timeout: opts.ready_timeout,
                });
            }
        };

        counter!("harness_tunnels_opened_total", 1);
        info!(
            pod = %pod,
            local_port = local_addr.port(),
            remote_port = target_port,
            "Tunnel established"
        );

        Ok(Tunnel {
            pod,
            target_port,
            local_addr,
            state,
            shutdown,
            task: Some(task),
            close_timeout: opts.close_timeout,
        })
    }
}

/// A loopback port forwarding to a pod port.
///
/// Dropping the handle stops forwarding; [`Tunnel::close`] additionally waits
/// for the background loop to finish.
#[derive(Debug)]
pub struct Tunnel {
    pod: PodRef,
    target_port: u16,
    local_addr: SocketAddr,
    state: Arc<watch::Sender<TunnelState>>,
    shutdown: CancelToken,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl Tunnel {
    pub fn pod(&self) -> &PodRef {
        &self.pod
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), TunnelState::Ready)
    }

    /// Fails with [`TunnelError::ConnectionClosed`] once the tunnel is closed
    pub fn ensure_open(&self) -> Result<(), TunnelError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TunnelError::ConnectionClosed {
                pod: self.pod.to_string(),
            })
        }
    }

    /// Connect to the local end of the tunnel
    pub async fn connect(&self) -> Result<TcpStream, TunnelError> {
        self.ensure_open()?;
        match TcpStream::connect(self.local_addr).await {
            Ok(stream) => Ok(stream),
            Err(_) if !self.is_open() => Err(TunnelError::ConnectionClosed {
                pod: self.pod.to_string(),
            }),
            Err(e) => Err(TunnelError::Io(e)),
        }
    }

    /// Wait up to `timeout` for the tunnel to close; returns the final state
    pub async fn wait_closed(&self, timeout: Duration) -> Option<CloseReason> {
        let mut rx = self.state.subscribe();
        let closed = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, TunnelState::Closed(_))),
        )
        .await;

        match closed {
            Ok(Ok(state)) => match &*state {
                TunnelState::Closed(reason) => Some(reason.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Stop forwarding and release the local port.
    ///
    /// Safe to call repeatedly. Open connections through the tunnel are cut,
    /// and the background loop is aborted if it does not stop within the
    /// close timeout.
    pub async fn close(&mut self) {
        self.shutdown.cancel();

        let Some(mut task) = self.task.take() else {
            return;
        };

        if tokio::time::timeout(self.close_timeout, &mut task)
            .await
            .is_err()
        {
            warn!(pod = %self.pod, "Forwarding loop ignored shutdown, aborting");
            task.abort();
            let _ = task.await;
        }

        mark_closed(&self.state, CloseReason::Requested);
        counter!("harness_tunnels_closed_total", 1);
        info!(pod = %self.pod, local_port = self.local_port(), "Tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!(local_port = self.local_port(), "Dropping open tunnel");
            self.shutdown.cancel();
            task.abort();
            mark_closed(&self.state, CloseReason::Requested);
        }
    }
}

fn mark_closed(state: &watch::Sender<TunnelState>, reason: CloseReason) {
    state.send_if_modified(|s| {
        if matches!(s, TunnelState::Closed(_)) {
            false
        } else {
            *s = TunnelState::Closed(reason);
            true
        }
    });
}

async fn handshake<C: PodConnector + ?Sized>(
    connector: &C,
    pod: &PodRef,
    port: u16,
    timeout: Duration,
) -> Result<(), TunnelError> {
    match tokio::time::timeout(timeout, connector.connect(pod, port)).await {
        Ok(Ok(_upstream)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TunnelError::Connection {
            pod: pod.to_string(),
            reason: format!("handshake exceeded {:?}", timeout),
        }),
    }
}

/// Accept local connections until shutdown or a fatal upstream failure.
///
/// Besides failed relay handshakes, a periodic liveness handshake closes the
/// tunnel once the pod stops answering, even while no client is connected.
async fn forward_loop<C: PodConnector>(
    connector: Arc<C>,
    pod: PodRef,
    port: u16,
    opts: TunnelOptions,
    state: Arc<watch::Sender<TunnelState>>,
    shutdown: CancelToken,
    ready: oneshot::Sender<io::Result<SocketAddr>>,
) {
    let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            mark_closed(&state, CloseReason::Failed(e.to_string()));
            let _ = ready.send(Err(e));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            mark_closed(&state, CloseReason::Failed(e.to_string()));
            let _ = ready.send(Err(e));
            return;
        }
    };

    state.send_replace(TunnelState::Ready);
    if ready.send(Ok(local_addr)).is_err() {
        // `open` gave up waiting
        mark_closed(&state, CloseReason::Requested);
        return;
    }

    debug!(local_port = local_addr.port(), "Forwarding loop started");

    // interval() panics on a zero period
    let period = opts.liveness_interval.max(Duration::from_millis(10));
    let mut liveness = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut connections: JoinSet<Result<(), TunnelError>> = JoinSet::new();
    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break CloseReason::Requested,
            _ = liveness.tick() => {
                let checked = check_liveness(connector.as_ref(), &pod, port, opts, &shutdown);
                if let Some(reason) = checked.await {
                    break reason;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(client_addr = %peer, "New tunnel connection");
                    connections.spawn(relay(
                        Arc::clone(&connector),
                        pod.clone(),
                        port,
                        stream,
                        opts.handshake_timeout,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Tunnel accept error");
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                match finished {
                    Ok(Err(e @ TunnelError::Connection { .. })) => {
                        warn!(pod = %pod, error = %e, "Upstream unavailable, closing tunnel");
                        break CloseReason::Failed(e.to_string());
                    }
                    Ok(Err(e)) => debug!(error = %e, "Tunnel connection ended with error"),
                    Ok(Ok(())) => {}
                    Err(e) if e.is_panic() => warn!("Tunnel connection task panicked"),
                    Err(_) => {}
                }
            }
        }
    };

    drop(listener);
    connections.shutdown().await;
    mark_closed(&state, outcome);
    debug!(local_port = local_addr.port(), "Forwarding loop stopped");
}

/// One handshake against the pod; `None` while it still answers
async fn check_liveness<C: PodConnector + ?Sized>(
    connector: &C,
    pod: &PodRef,
    port: u16,
    opts: TunnelOptions,
    shutdown: &CancelToken,
) -> Option<CloseReason> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Some(CloseReason::Requested),
        result = handshake(connector, pod, port, opts.handshake_timeout) => match result {
            Ok(()) => {
                trace!(pod = %pod, "Liveness handshake ok");
                None
            }
            Err(e) => {
                warn!(pod = %pod, error = %e, "Liveness handshake failed, closing tunnel");
                Some(CloseReason::Failed(e.to_string()))
            }
        },
    }
}

/// Pump bytes between one local connection and a fresh upstream stream
async fn relay<C: PodConnector>(
    connector: Arc<C>,
    pod: PodRef,
    port: u16,
    mut local: TcpStream,
    handshake_timeout: Duration,
) -> Result<(), TunnelError> {
    let mut upstream = match tokio::time::timeout(handshake_timeout, connector.connect(&pod, port))
        .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(TunnelError::Connection {
                pod: pod.to_string(),
                reason: format!("handshake exceeded {:?}", handshake_timeout),
            })
        }
    };

    counter!("harness_tunnel_connections_total", 1);
    let (sent, received) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await?;
    trace!(sent, received, "Tunnel connection finished");
    Ok(())
}
