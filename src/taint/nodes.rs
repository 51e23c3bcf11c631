//! Applying taint mutations to cluster nodes
//!
//! Each mutation is a single get-then-replace. The replace carries the
//! fetched `resourceVersion`, so a concurrent writer makes it fail with a 409
//! instead of being overwritten; retrying is left to the caller.

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as core;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::algebra::{diff, union};
use super::types::{NodeTaintSet, Taint};
use super::TaintError;

/// Node access used by [`NodeTainter`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<core::Node, kube::Error>;

    /// Replace the node, honouring `metadata.resourceVersion`
    async fn replace(&self, node: &core::Node) -> Result<core::Node, kube::Error>;

    /// List nodes; an empty selector lists all of them
    async fn list(&self, label_selector: &str) -> Result<Vec<core::Node>, kube::Error>;
}

/// [`NodeStore`] backed by the cluster API
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<core::Node>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get(&self, name: &str) -> Result<core::Node, kube::Error> {
        self.api.get(name).await
    }

    async fn replace(&self, node: &core::Node) -> Result<core::Node, kube::Error> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        self.api.replace(name, &PostParams::default(), node).await
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<core::Node>, kube::Error> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(self.api.list(&params).await?.items)
    }
}

/// What happened to one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaintOutcome {
    /// The taint list was written
    Changed,
    /// The computed set equalled the current one, no write issued
    Unchanged,
    /// Control-plane node left alone
    Skipped,
}

/// Per-node results of a batch mutation
///
/// A batch never stops at the first failing node. When `failed` is not empty
/// the batch returns [`TaintError::Incomplete`] carrying this report, so the
/// caller still learns which nodes were written.
#[derive(Debug, Default)]
pub struct TaintReport {
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, TaintError)>,
}

impl TaintReport {
    fn record(&mut self, node: String, outcome: TaintOutcome) {
        match outcome {
            TaintOutcome::Changed => self.changed.push(node),
            TaintOutcome::Unchanged => self.unchanged.push(node),
            TaintOutcome::Skipped => self.skipped.push(node),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.failed.iter().map(|(node, _)| node.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Add,
    Remove,
}

impl Mutation {
    fn verb(self) -> &'static str {
        match self {
            Mutation::Add => "taint",
            Mutation::Remove => "untaint",
        }
    }
}

/// Computes and writes node taint mutations
pub struct NodeTainter<S = KubeNodeStore> {
    store: S,
}

impl NodeTainter<KubeNodeStore> {
    pub fn from_client(client: Client) -> Self {
        Self::new(KubeNodeStore::new(client))
    }
}

impl<S: NodeStore> NodeTainter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current taints of a node
    pub async fn taints_of(&self, name: &str) -> Result<NodeTaintSet, TaintError> {
        let node = self.store.get(name).await?;
        NodeTaintSet::from_node(&node)
    }

    /// Add `taints` to one node
    #[instrument(skip(self, taints), fields(count = taints.len()))]
    pub async fn taint_node(
        &self,
        name: &str,
        taints: &NodeTaintSet,
    ) -> Result<TaintOutcome, TaintError> {
        self.mutate(name, taints, Mutation::Add, false).await
    }

    /// Remove `taints` from one node
    #[instrument(skip(self, taints), fields(count = taints.len()))]
    pub async fn untaint_node(
        &self,
        name: &str,
        taints: &NodeTaintSet,
    ) -> Result<TaintOutcome, TaintError> {
        self.mutate(name, taints, Mutation::Remove, false).await
    }

    /// Add `taints` to every listed node except control-plane nodes.
    ///
    /// Fails with [`TaintError::Incomplete`] if any node could not be
    /// mutated; the nodes written before that are listed in its report.
    #[instrument(skip(self, taints), fields(nodes = names.len()))]
    pub async fn taint_all(
        &self,
        names: &[String],
        taints: &NodeTaintSet,
    ) -> Result<TaintReport, TaintError> {
        self.mutate_all(names, taints, Mutation::Add).await
    }

    /// Inverse of [`NodeTainter::taint_all`], with the same control-plane guard
    #[instrument(skip(self, taints), fields(nodes = names.len()))]
    pub async fn untaint_all(
        &self,
        names: &[String],
        taints: &NodeTaintSet,
    ) -> Result<TaintReport, TaintError> {
        self.mutate_all(names, taints, Mutation::Remove).await
    }

    /// Names of all nodes without a control-plane taint.
    ///
    /// Nodes whose taints cannot be read as a set (a NotReady node carries
    /// `node.kubernetes.io/unreachable` under two effects) are left out.
    pub async fn worker_nodes(&self) -> Result<Vec<String>, TaintError> {
        let nodes = self.store.list("").await?;
        let mut names = Vec::new();
        for node in nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            match NodeTaintSet::from_node(&node) {
                Ok(taints) if taints.is_control_plane() => {}
                Ok(_) => names.push(name),
                Err(e) => warn!(node = %name, error = %e, "Skipping node with unreadable taints"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn mutate_all(
        &self,
        names: &[String],
        taints: &NodeTaintSet,
        mutation: Mutation,
    ) -> Result<TaintReport, TaintError> {
        let results = futures::future::join_all(
            names
                .iter()
                .map(|name| self.mutate(name, taints, mutation, true)),
        )
        .await;

        let mut report = TaintReport::default();
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(outcome) => report.record(name.clone(), outcome),
                Err(e) => {
                    warn!(node = %name, error = %e, "Failed to {} node", mutation.verb());
                    report.failed.push((name.clone(), e));
                }
            }
        }

        info!(
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Batch {} finished",
            mutation.verb()
        );

        if report.is_complete() {
            Ok(report)
        } else {
            Err(TaintError::Incomplete(Box::new(report)))
        }
    }

    async fn mutate(
        &self,
        name: &str,
        taints: &NodeTaintSet,
        mutation: Mutation,
        guard_control_plane: bool,
    ) -> Result<TaintOutcome, TaintError> {
        let mut node = self.store.get(name).await?;
        let current = NodeTaintSet::from_node(&node)?;

        if guard_control_plane && current.is_control_plane() {
            warn!(node = name, "Skipping control-plane node");
            return Ok(TaintOutcome::Skipped);
        }

        let desired = match mutation {
            Mutation::Add => union(&current, taints),
            Mutation::Remove => diff(&current, taints),
        }
        .map_err(|source| TaintError::NodeConflict {
            node: name.to_string(),
            source,
        })?;

        if desired == current {
            debug!(node = name, "Taints already in desired state");
            return Ok(TaintOutcome::Unchanged);
        }

        let spec = node.spec.get_or_insert_with(Default::default);
        let rendered = render(spec.taints.as_deref().unwrap_or_default(), &desired);
        spec.taints = if rendered.is_empty() {
            None
        } else {
            Some(rendered)
        };

        self.store.replace(&node).await?;
        counter!("harness_node_taint_writes_total", 1, "op" => mutation.verb());
        info!(node = name, taints = desired.len(), "Applied {}", mutation.verb());
        Ok(TaintOutcome::Changed)
    }
}

/// Build the new `spec.taints` list, keeping surviving entries as they were
/// (order and `timeAdded` included) and appending new ones in set order.
fn render(original: &[core::Taint], desired: &NodeTaintSet) -> Vec<core::Taint> {
    let mut out: Vec<core::Taint> = original
        .iter()
        .filter(|raw| {
            Taint::try_from(*raw)
                .map(|t| desired.contains(&t))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    for taint in desired.iter() {
        if !out.iter().any(|raw| raw.key == taint.key) {
            out.push(core::Taint::from(&taint));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taint::TaintEffect;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, taints: &[Taint]) -> core::Node {
        core::Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(core::NodeSpec {
                taints: if taints.is_empty() {
                    None
                } else {
                    Some(taints.iter().map(core::Taint::from).collect())
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn master_taint() -> Taint {
        Taint::keyed("node-role.kubernetes.io/master", TaintEffect::NoSchedule)
    }

    fn chaos_taint() -> NodeTaintSet {
        NodeTaintSet::from_taints(&[Taint::new("e2e/chaos", "true", TaintEffect::NoSchedule)])
            .unwrap()
    }

    #[tokio::test]
    async fn test_taint_all_never_touches_control_plane() {
        let mut store = MockNodeStore::new();
        store.expect_get().returning(|name| {
            if name == "master-0" {
                Ok(node(name, &[master_taint()]))
            } else {
                Ok(node(name, &[]))
            }
        });
        store
            .expect_replace()
            .withf(|n| n.metadata.name.as_deref() != Some("master-0"))
            .times(2)
            .returning(|n| Ok(n.clone()));

        let tainter = NodeTainter::new(store);
        let names = vec![
            "master-0".to_string(),
            "worker-0".to_string(),
            "worker-1".to_string(),
        ];
        let report = tainter.taint_all(&names, &chaos_taint()).await.unwrap();

        assert_eq!(report.skipped, vec!["master-0"]);
        assert_eq!(report.changed, vec!["worker-0", "worker-1"]);
    }

    #[tokio::test]
    async fn test_noop_mutation_skips_write() {
        let existing = chaos_taint().to_vec();
        let mut store = MockNodeStore::new();
        store
            .expect_get()
            .returning(move |name| Ok(node(name, &existing)));
        store.expect_replace().never();

        let tainter = NodeTainter::new(store);
        let outcome = tainter
            .taint_node("worker-0", &chaos_taint())
            .await
            .unwrap();
        assert_eq!(outcome, TaintOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_untaint_writes_remainder_and_keeps_resource_version() {
        let keep = Taint::new("keep", "me", TaintEffect::NoExecute);
        let mut all = chaos_taint().to_vec();
        all.push(keep.clone());

        let mut store = MockNodeStore::new();
        store
            .expect_get()
            .returning(move |name| Ok(node(name, &all)));
        store
            .expect_replace()
            .withf(move |n| {
                let taints = n.spec.as_ref().unwrap().taints.as_ref().unwrap();
                n.metadata.resource_version.as_deref() == Some("42")
                    && taints.len() == 1
                    && taints[0].key == "keep"
            })
            .times(1)
            .returning(|n| Ok(n.clone()));

        let tainter = NodeTainter::new(store);
        let outcome = tainter
            .untaint_node("worker-0", &chaos_taint())
            .await
            .unwrap();
        assert_eq!(outcome, TaintOutcome::Changed);
    }

    #[tokio::test]
    async fn test_conflicting_taint_reports_node() {
        let mut store = MockNodeStore::new();
        store.expect_get().returning(|name| {
            Ok(node(
                name,
                &[Taint::new("e2e/chaos", "false", TaintEffect::NoSchedule)],
            ))
        });
        store.expect_replace().never();

        let tainter = NodeTainter::new(store);
        let err = tainter
            .taint_node("worker-0", &chaos_taint())
            .await
            .unwrap_err();
        match err {
            TaintError::NodeConflict { node, source } => {
                assert_eq!(node, "worker-0");
                assert_eq!(source.key, "e2e/chaos");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_worker_nodes_excludes_control_plane() {
        let mut store = MockNodeStore::new();
        store.expect_list().returning(|_| {
            Ok(vec![
                node("worker-1", &[]),
                node("master-0", &[master_taint()]),
                node("worker-0", &[]),
            ])
        });

        let tainter = NodeTainter::new(store);
        assert_eq!(
            tainter.worker_nodes().await.unwrap(),
            vec!["worker-0", "worker-1"]
        );
    }

    fn conflict() -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
    }

    #[tokio::test]
    async fn test_one_failed_write_keeps_the_rest_of_the_report() {
        let mut store = MockNodeStore::new();
        store.expect_get().returning(|name| Ok(node(name, &[])));
        store.expect_replace().times(3).returning(|n| {
            if n.metadata.name.as_deref() == Some("worker-1") {
                Err(conflict())
            } else {
                Ok(n.clone())
            }
        });

        let tainter = NodeTainter::new(store);
        let names = vec![
            "worker-0".to_string(),
            "worker-1".to_string(),
            "worker-2".to_string(),
        ];
        let err = tainter.taint_all(&names, &chaos_taint()).await.unwrap_err();

        let report = match err {
            TaintError::Incomplete(report) => report,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(report.changed, vec!["worker-0", "worker-2"]);
        assert_eq!(report.failed_nodes(), vec!["worker-1"]);
        assert!(matches!(
            &report.failed[0].1,
            TaintError::Kube(kube::Error::Api(resp)) if resp.code == 409
        ));
    }

    #[tokio::test]
    async fn test_worker_nodes_skips_unreachable_node() {
        let unreachable = [
            Taint::keyed("node.kubernetes.io/unreachable", TaintEffect::NoSchedule),
            Taint::keyed("node.kubernetes.io/unreachable", TaintEffect::NoExecute),
        ];
        let mut store = MockNodeStore::new();
        store.expect_list().returning(move |_| {
            Ok(vec![
                node("worker-0", &[]),
                node("worker-1", &unreachable),
                node("worker-2", &[]),
            ])
        });

        let tainter = NodeTainter::new(store);
        assert_eq!(
            tainter.worker_nodes().await.unwrap(),
            vec!["worker-0", "worker-2"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_does_not_stop_the_batch() {
        let mut store = MockNodeStore::new();
        store.expect_get().returning(|name| {
            if name == "worker-1" {
                Ok(node(
                    name,
                    &[
                        Taint::keyed("node.kubernetes.io/unreachable", TaintEffect::NoSchedule),
                        Taint::keyed("node.kubernetes.io/unreachable", TaintEffect::NoExecute),
                    ],
                ))
            } else {
                Ok(node(name, &[]))
            }
        });
        store
            .expect_replace()
            .times(1)
            .returning(|n| Ok(n.clone()));

        let tainter = NodeTainter::new(store);
        let names = vec!["worker-0".to_string(), "worker-1".to_string()];
        let err = tainter.taint_all(&names, &chaos_taint()).await.unwrap_err();

        let report = match err {
            TaintError::Incomplete(report) => report,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(report.changed, vec!["worker-0"]);
        assert_eq!(report.failed_nodes(), vec!["worker-1"]);
    }

    #[test]
    fn test_render_preserves_existing_entries() {
        let mut original = core::Taint::from(&Taint::new("old", "1", TaintEffect::NoSchedule));
        original.time_added = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));

        let desired = NodeTaintSet::from_taints(&[
            Taint::new("old", "1", TaintEffect::NoSchedule),
            Taint::keyed("new", TaintEffect::NoExecute),
        ])
        .unwrap();

        let rendered = render(std::slice::from_ref(&original), &desired);
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0], original);
        assert_eq!(rendered[1].key, "new");
    }
}
