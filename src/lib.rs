//! Cluster-test orchestration primitives for data service operators
//!
//! - [`tunnel`]: loopback tunnels into pods over the port-forward API
//! - [`poll`]: bounded, cancellable "wait until" polling
//! - [`taint`]: taint/toleration set algebra and node mutations
//! - [`chaos`]: Chaos Mesh fault lifecycle
//! - [`dsi`]: data service kinds and instance readiness
//!
//! [`Harness`] ties them to one cluster connection and configuration.

pub mod chaos;
pub mod config;
pub mod dsi;
pub mod error;
pub mod harness;
pub mod k8s;
pub mod poll;
pub mod taint;
pub mod telemetry;
pub mod tunnel;

pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use harness::Harness;
