//! Cluster connection and API error helpers

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, instrument};

use super::ClusterError;
use crate::poll::ConditionError;

/// Connect to the cluster.
///
/// An explicit kubeconfig path wins; otherwise the usual inference applies
/// (`KUBECONFIG`, `~/.kube/config`, then in-cluster).
#[instrument]
pub async fn connect(kubeconfig: Option<&str>) -> Result<Client, ClusterError> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(|source| ClusterError::Kubeconfig {
                    path: path.to_string(),
                    source,
                })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|source| ClusterError::Kubeconfig {
                    path: path.to_string(),
                    source,
                })?
        }
        None => Config::infer().await?,
    };

    let cluster_url = config.cluster_url.to_string();
    let client = Client::try_from(config)?;
    info!(%cluster_url, "Connected to Kubernetes cluster");
    Ok(client)
}

/// Check if the cluster is reachable
pub async fn health_check(client: &Client) -> Result<String, ClusterError> {
    let version = client.apiserver_version().await?;
    info!(version = %version.git_version, "Kubernetes cluster is healthy");
    Ok(version.git_version)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Classify an API error for a polled condition.
///
/// Not-found, throttling, server-side and transport errors are retried;
/// any other client error ends the wait.
pub fn condition_error(err: kube::Error) -> ConditionError {
    let retryable = match &err {
        kube::Error::Api(e) => e.code == 404 || e.code == 429 || e.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    };

    if retryable {
        ConditionError::retryable(err.to_string())
    } else {
        ConditionError::fatal(err.to_string())
    }
}
