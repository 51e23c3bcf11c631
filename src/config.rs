use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::poll::PollPolicy;
use crate::tunnel::TunnelOptions;

/// Prefix of the environment variables read by [`HarnessConfig::load`]
pub const ENV_PREFIX: &str = "DSI_HARNESS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: Option<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Where fault objects are created; the test namespace when unset
    #[serde(default)]
    pub chaos_namespace: Option<String>,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Distinguishes parallel workers sharing a cluster
    #[serde(default)]
    pub worker_id: u32,

    #[serde(default = "default_data_service_kind")]
    pub data_service_kind: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_tunnel_ready_timeout_secs")]
    pub tunnel_ready_timeout_secs: u64,

    #[serde(default = "default_tunnel_handshake_timeout_secs")]
    pub tunnel_handshake_timeout_secs: u64,

    #[serde(default = "default_tunnel_close_timeout_ms")]
    pub tunnel_close_timeout_ms: u64,

    #[serde(default = "default_tunnel_liveness_interval_ms")]
    pub tunnel_liveness_interval_ms: u64,

    #[serde(default = "default_fault_active_timeout_secs")]
    pub fault_active_timeout_secs: u64,
}

fn default_kubeconfig() -> Option<String> {
    None
}

fn default_namespace() -> String {
    "a8s-e2e".to_string()
}

fn default_name_prefix() -> String {
    "e2e".to_string()
}

fn default_data_service_kind() -> String {
    "postgresql".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_poll_timeout_secs() -> u64 {
    300
}

fn default_tunnel_ready_timeout_secs() -> u64 {
    10
}

fn default_tunnel_handshake_timeout_secs() -> u64 {
    10
}

fn default_tunnel_close_timeout_ms() -> u64 {
    2000
}

fn default_tunnel_liveness_interval_ms() -> u64 {
    5000
}

fn default_fault_active_timeout_secs() -> u64 {
    300
}

impl HarnessConfig {
    /// Load from `DSI_HARNESS_*` variables, after reading `.env` if present
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env(None)
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::from_env(Some(vars))
    }

    fn from_env(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let source = config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .source(vars);

        let config = config::Config::builder()
            .add_source(source)
            .build()
            .context("failed to read harness configuration")?;

        config
            .try_deserialize()
            .context("invalid harness configuration")
    }

    pub fn chaos_namespace(&self) -> &str {
        self.chaos_namespace.as_deref().unwrap_or(&self.namespace)
    }

    /// `<name_prefix>-<worker_id>`, unique per parallel worker
    pub fn run_prefix(&self) -> String {
        format!("{}-{}", self.name_prefix, self.worker_id)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_timeout_secs),
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            ready_timeout: Duration::from_secs(self.tunnel_ready_timeout_secs),
            handshake_timeout: Duration::from_secs(self.tunnel_handshake_timeout_secs),
            close_timeout: Duration::from_millis(self.tunnel_close_timeout_ms),
            liveness_interval: Duration::from_millis(self.tunnel_liveness_interval_ms),
        }
    }

    pub fn fault_active_timeout(&self) -> Duration {
        Duration::from_secs(self.fault_active_timeout_secs)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            kubeconfig: default_kubeconfig(),
            namespace: default_namespace(),
            chaos_namespace: None,
            name_prefix: default_name_prefix(),
            worker_id: 0,
            data_service_kind: default_data_service_kind(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            tunnel_ready_timeout_secs: default_tunnel_ready_timeout_secs(),
            tunnel_handshake_timeout_secs: default_tunnel_handshake_timeout_secs(),
            tunnel_close_timeout_ms: default_tunnel_close_timeout_ms(),
            tunnel_liveness_interval_ms: default_tunnel_liveness_interval_ms(),
            fault_active_timeout_secs: default_fault_active_timeout_secs(),
        }
    }
}
