//! Fault injection through Chaos Mesh
//!
//! A test builds a [`FaultSpec`], submits it with [`FaultLifecycle::create`],
//! waits for [`FaultLifecycle::wait_active`] before its disruption window and
//! calls [`FaultLifecycle::remove`] afterwards. Overlapping faults against the
//! same pods are not detected.

mod client;
mod manifest;
mod types;

use thiserror::Error;

use crate::poll::PollError;

pub use client::{all_injected, FaultLifecycle, FaultStore, KubeFaultStore};
pub use manifest::{fault_manifest, fault_object, run_selector, MANAGED_BY_LABEL, RUN_LABEL};
pub use types::*;

#[derive(Error, Debug)]
pub enum FaultError {
    #[error("invalid fault spec: {0}")]
    InvalidSpec(String),

    #[error("failed to submit {kind} '{name}': {source}")]
    FatalSubmission {
        kind: FaultKind,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error(transparent)]
    Wait(#[from] PollError),

    #[error("fault '{0}' was already removed")]
    AlreadyRemoved(String),

    #[error("cleanup deleted {deleted} fault(s) but left {}", failed_names(.failed))]
    CleanupIncomplete {
        deleted: usize,
        failed: Vec<(String, kube::Error)>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

fn failed_names(failed: &[(String, kube::Error)]) -> String {
    failed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
