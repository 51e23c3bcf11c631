//! Data service instances under test
//!
//! Each data service kind implements [`DataService`]; the
//! [`DataServiceRegistry`] maps a kind name from configuration to an
//! implementation, so call sites never branch on the kind.

mod instances;
mod postgresql;
mod registry;
mod service;

use thiserror::Error;

use crate::poll::PollError;

pub use instances::{DataServiceInstances, InstanceStore, KubeInstanceStore};
pub use postgresql::{PostgreSql, POSTGRESQL_KIND};
pub use registry::DataServiceRegistry;
pub use service::DataService;

#[derive(Error, Debug)]
pub enum DataServiceError {
    #[error("unknown data service kind '{kind}' (registered: {known})")]
    UnknownKind { kind: String, known: String },

    #[error("invalid instance spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Wait(#[from] PollError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}
