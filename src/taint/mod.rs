//! Taint/toleration set algebra
//!
//! Pure set operations over node taints plus the node read-modify-write that
//! applies them. Used by topology tests to push data service pods off a set
//! of nodes and to restore those nodes afterwards.

mod algebra;
mod nodes;
mod types;

use thiserror::Error;

pub use algebra::{diff, union, TaintConflict};
pub use nodes::{KubeNodeStore, NodeStore, NodeTainter, TaintOutcome, TaintReport};
pub use types::{
    schedulable_with, tolerations_for, NodeTaintSet, Taint, TaintEffect, TaintValue, Toleration,
    TolerationOperator, CONTROL_PLANE_TAINT_KEYS,
};

#[derive(Debug, Error)]
pub enum TaintError {
    #[error(transparent)]
    Conflict(#[from] TaintConflict),

    #[error("node {node}: {source}")]
    NodeConflict {
        node: String,
        #[source]
        source: TaintConflict,
    },

    #[error("taint '{key}' has unsupported effect '{effect}'")]
    InvalidEffect { key: String, effect: String },

    #[error("invalid taint '{0}', expected key[=value]:Effect")]
    Parse(String),

    #[error("batch failed on {} node(s): {}", .0.failed.len(), .0.failed_nodes().join(", "))]
    Incomplete(Box<TaintReport>),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}
