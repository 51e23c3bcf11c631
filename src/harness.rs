//! The per-run harness context
//!
//! Built once per test run and passed to the tests explicitly; every
//! component the tests use is derived from it.

use std::sync::Arc;

use kube::Client;
use tracing::{info, instrument};

use crate::chaos::FaultLifecycle;
use crate::config::HarnessConfig;
use crate::dsi::{DataService, DataServiceInstances, DataServiceRegistry};
use crate::error::HarnessResult;
use crate::k8s;
use crate::poll::{CancelToken, PollPolicy};
use crate::taint::NodeTainter;
use crate::tunnel::TunnelManager;

pub struct Harness {
    client: Client,
    config: HarnessConfig,
    registry: DataServiceRegistry,
    cancel: CancelToken,
}

impl Harness {
    /// Connect to the cluster described by `config`
    #[instrument(skip(config), fields(namespace = %config.namespace))]
    pub async fn connect(config: HarnessConfig) -> HarnessResult<Self> {
        let client = k8s::connect(config.kubeconfig.as_deref()).await?;
        k8s::health_check(&client).await?;
        let harness = Self::new(client, config);
        info!(prefix = %harness.config.run_prefix(), "Harness ready");
        Ok(harness)
    }

    /// Build around an existing client with the default registry
    pub fn new(client: Client, config: HarnessConfig) -> Self {
        Self::with_registry(client, config, DataServiceRegistry::default())
    }

    pub fn with_registry(
        client: Client,
        config: HarnessConfig,
        registry: DataServiceRegistry,
    ) -> Self {
        Self {
            client,
            config,
            registry,
            cancel: CancelToken::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn registry(&self) -> &DataServiceRegistry {
        &self.registry
    }

    /// Cancelling this token aborts every wait started through the harness
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn tunnels(&self) -> TunnelManager {
        TunnelManager::from_client(
            self.client.clone(),
            &self.config.namespace,
            self.config.tunnel_options(),
        )
    }

    pub fn faults(&self) -> FaultLifecycle {
        FaultLifecycle::from_client(
            self.client.clone(),
            self.config.chaos_namespace(),
            &self.config.run_prefix(),
        )
        .with_interval(self.default_poll_policy().interval())
        .with_cancel(self.cancel.clone())
    }

    pub fn nodes(&self) -> NodeTainter {
        NodeTainter::from_client(self.client.clone())
    }

    /// The configured data service kind
    pub fn data_service(&self) -> HarnessResult<Arc<dyn DataService>> {
        Ok(self.registry.get(&self.config.data_service_kind)?)
    }

    /// Instances of the configured data service kind in the test namespace
    pub fn instances(&self) -> HarnessResult<DataServiceInstances> {
        Ok(DataServiceInstances::from_client(
            self.client.clone(),
            self.data_service()?,
            &self.config.namespace,
        )
        .with_cancel(self.cancel.clone()))
    }

    /// Resource name unique to this worker
    pub fn resource_name(&self, suffix: &str) -> String {
        resource_name(&self.config, suffix)
    }

    pub fn default_poll_policy(&self) -> PollPolicy {
        self.config.poll_policy()
    }
}

/// `<prefix>-<worker>-<suffix>`, lowercased and cut to the 63 characters
/// allowed in a label value
pub fn resource_name(config: &HarnessConfig, suffix: &str) -> String {
    let mut name: String = format!("{}-{}", config.run_prefix(), suffix)
        .to_lowercase()
        .chars()
        .take(63)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}
