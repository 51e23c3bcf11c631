use thiserror::Error;

use crate::chaos::FaultError;
use crate::dsi::DataServiceError;
use crate::k8s::ClusterError;
use crate::poll::PollError;
use crate::taint::TaintError;
use crate::tunnel::TunnelError;

/// Any failure surfaced by the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("Taint error: {0}")]
    Taint(#[from] TaintError),

    #[error("Fault error: {0}")]
    Fault(#[from] FaultError),

    #[error("Data service error: {0}")]
    DataService(#[from] DataServiceError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl HarnessError {
    /// `true` when the error came from a wait that ran out of time
    pub fn is_deadline_exceeded(&self) -> bool {
        let poll = match self {
            HarnessError::Poll(e) => Some(e),
            HarnessError::Fault(FaultError::Wait(e)) => Some(e),
            HarnessError::DataService(DataServiceError::Wait(e)) => Some(e),
            _ => None,
        };
        poll.is_some_and(PollError::is_deadline_exceeded)
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
