//! Upstream connections into pods
//!
//! A [`PodConnector`] turns a pod and container port into a byte stream. The
//! tunnel asks for one stream per accepted local connection.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::TunnelError;

/// Namespaced pod identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What a tunnel points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelTarget {
    /// A pod by name
    Pod { name: String },
    /// The first running pod matching a label selector
    Selector { labels: String },
}

impl TunnelTarget {
    pub fn pod(name: impl Into<String>) -> Self {
        Self::Pod { name: name.into() }
    }

    pub fn selector(labels: impl Into<String>) -> Self {
        Self::Selector {
            labels: labels.into(),
        }
    }
}

/// Bidirectional byte stream to a pod port
pub trait Upstream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Upstream for T {}

pub type BoxedUpstream = Box<dyn Upstream>;

#[async_trait]
pub trait PodConnector: Send + Sync + 'static {
    /// Resolve a target to a concrete pod.
    ///
    /// The default only understands [`TunnelTarget::Pod`].
    async fn resolve(&self, namespace: &str, target: &TunnelTarget) -> Result<PodRef, TunnelError> {
        match target {
            TunnelTarget::Pod { name } => Ok(PodRef::new(namespace, name.clone())),
            TunnelTarget::Selector { labels } => Err(TunnelError::NoPodsFound(labels.clone())),
        }
    }

    /// Open one upstream stream to `port` inside `pod`
    async fn connect(&self, pod: &PodRef, port: u16) -> Result<BoxedUpstream, TunnelError>;
}

/// Connector using the API server's `pods/portforward` subresource
#[derive(Clone)]
pub struct KubeConnector {
    client: Client,
}

impl KubeConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodConnector for KubeConnector {
    async fn resolve(&self, namespace: &str, target: &TunnelTarget) -> Result<PodRef, TunnelError> {
        let labels = match target {
            TunnelTarget::Pod { name } => return Ok(PodRef::new(namespace, name.clone())),
            TunnelTarget::Selector { labels } => labels,
        };

        debug!(label_selector = %labels, "Resolving selector to pod");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_list = pods.list(&ListParams::default().labels(labels)).await?;

        pod_list
            .items
            .into_iter()
            .find(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .and_then(|p| p.metadata.name)
            .map(|name| PodRef::new(namespace, name))
            .ok_or_else(|| TunnelError::NoPodsFound(labels.clone()))
    }

    async fn connect(&self, pod: &PodRef, port: u16) -> Result<BoxedUpstream, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);

        let mut forwarder =
            pods.portforward(&pod.name, &[port])
                .await
                .map_err(|e| TunnelError::Connection {
                    pod: pod.to_string(),
                    reason: e.to_string(),
                })?;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| TunnelError::Connection {
                pod: pod.to_string(),
                reason: format!("upgrade returned no stream for port {}", port),
            })?;

        // The forwarder finishes once the stream above is dropped
        let target = pod.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(pod = %target, error = %e, "Port forward stream ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopConnector;

    #[async_trait]
    impl PodConnector for NoopConnector {
        async fn connect(&self, pod: &PodRef, _port: u16) -> Result<BoxedUpstream, TunnelError> {
            Err(TunnelError::Connection {
                pod: pod.to_string(),
                reason: "noop".to_string(),
            })
        }
    }

    #[test]
    fn test_pod_ref_display() {
        assert_eq!(PodRef::new("ns", "pg-0").to_string(), "ns/pg-0");
    }

    #[tokio::test]
    async fn test_default_resolve() {
        let connector = NoopConnector;
        let pod = connector
            .resolve("ns", &TunnelTarget::pod("pg-0"))
            .await
            .unwrap();
        assert_eq!(pod, PodRef::new("ns", "pg-0"));

        let err = connector
            .resolve("ns", &TunnelTarget::selector("a8s.a9s/replication-role=master"))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoPodsFound(_)));
    }
}
