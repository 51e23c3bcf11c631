//! Ephemeral TCP tunnels into cluster pods
//!
//! A test opens a [`Tunnel`] to a container port, talks to the data service
//! through the returned loopback port, and closes it. Tunnels never
//! reconnect: once the upstream is gone the tunnel is closed and the caller
//! opens a new one.

mod connector;
mod manager;

use std::time::Duration;

use thiserror::Error;

pub use connector::{BoxedUpstream, KubeConnector, PodConnector, PodRef, TunnelTarget, Upstream};
pub use manager::{CloseReason, Tunnel, TunnelManager, TunnelOptions, TunnelState};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid target port {0}")]
    InvalidPort(u16),

    #[error("no running pod matches selector: {0}")]
    NoPodsFound(String),

    #[error("failed to connect to {pod}: {reason}")]
    Connection { pod: String, reason: String },

    #[error("tunnel to {pod} was not ready within {timeout:?}")]
    ReadinessTimeout { pod: String, timeout: Duration },

    #[error("tunnel to {pod} is closed")]
    ConnectionClosed { pod: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
