//! Kubernetes connection helpers shared by the harness components

mod client;

use thiserror::Error;

pub use client::{condition_error, connect, health_check, is_conflict, is_not_found};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("failed to load kubeconfig '{path}': {source}")]
    Kubeconfig {
        path: String,
        #[source]
        source: kube::config::KubeconfigError,
    },

    #[error("failed to infer cluster config: {0}")]
    Infer(#[from] kube::config::InferConfigError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}
