//! Fault lifecycle against Chaos Mesh
//!
//! Creates, watches and removes `PodChaos`/`NetworkChaos` objects.

use std::time::Duration;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, PostParams},
    Client,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use super::manifest::{fault_object, run_selector};
use super::types::*;
use super::FaultError;
use crate::k8s::{condition_error, is_not_found};
use crate::poll::{poll_until, CancelToken, ConditionError, PollPolicy};

/// Access to chaos objects, one API per [`FaultKind`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FaultStore: Send + Sync {
    async fn create(
        &self,
        kind: FaultKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    async fn get(
        &self,
        kind: FaultKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error>;

    async fn delete(&self, kind: FaultKind, namespace: &str, name: &str)
        -> Result<(), kube::Error>;

    async fn list(
        &self,
        kind: FaultKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, kube::Error>;
}

/// [`FaultStore`] backed by the cluster API
#[derive(Clone)]
pub struct KubeFaultStore {
    client: Client,
}

impl KubeFaultStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: FaultKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl FaultStore for KubeFaultStore {
    async fn create(
        &self,
        kind: FaultKind,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(kind, namespace)
            .create(&PostParams::default(), obj)
            .await
    }

    async fn get(
        &self,
        kind: FaultKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(kind, namespace).get(name).await
    }

    async fn delete(
        &self,
        kind: FaultKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn list(
        &self,
        kind: FaultKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api(kind, namespace).list(&lp).await?.items)
    }
}

/// Submits faults and tracks them through Created, Active and Removed
pub struct FaultLifecycle<S = KubeFaultStore> {
    store: S,
    namespace: String,
    prefix: String,
    interval: Duration,
    cancel: CancelToken,
}

impl FaultLifecycle<KubeFaultStore> {
    pub fn from_client(client: Client, namespace: &str, prefix: &str) -> Self {
        Self::new(KubeFaultStore::new(client), namespace, prefix)
    }
}

impl<S: FaultStore> FaultLifecycle<S> {
    pub fn new(store: S, namespace: &str, prefix: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            interval: Duration::from_secs(2),
            cancel: CancelToken::new(),
        }
    }

    /// Cadence of the status checks in [`FaultLifecycle::wait_active`]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Cancelling `cancel` aborts any running wait
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Submit a fault. Any API failure is final.
    #[instrument(skip(self, spec), fields(action = spec.action.chaos_action()))]
    pub async fn create(&self, spec: &FaultSpec) -> Result<FaultHandle, FaultError> {
        spec.validate().map_err(FaultError::InvalidSpec)?;

        let kind = spec.kind();
        let name = self.fault_name(spec);
        let obj = fault_object(&name, &self.namespace, &self.prefix, spec)?;

        let created = self
            .store
            .create(kind, &self.namespace, &obj)
            .await
            .map_err(|source| FaultError::FatalSubmission {
                kind,
                name: name.clone(),
                source,
            })?;
        let name = created.metadata.name.unwrap_or(name);

        counter!("harness_faults_created_total", 1, "kind" => kind.to_string());
        info!(fault = %name, %kind, namespace = %self.namespace, "Created fault");

        Ok(FaultHandle::new(name, self.namespace.clone(), kind))
    }

    /// Wait until Chaos Mesh reports the fault as injected on all targets.
    ///
    /// On timeout the fault object is left in place.
    #[instrument(skip(self, handle), fields(fault = %handle.name()))]
    pub async fn wait_active(
        &self,
        handle: &mut FaultHandle,
        timeout: Duration,
    ) -> Result<(), FaultError> {
        match handle.phase() {
            FaultPhase::Removed => return Err(FaultError::AlreadyRemoved(handle.name().to_string())),
            FaultPhase::Active => return Ok(()),
            FaultPhase::Created => {}
        }

        let policy = PollPolicy::new(timeout, self.interval);
        let what = format!("fault {} to become active", handle.name());
        let (kind, namespace, name) = (handle.kind(), handle.namespace(), handle.name());

        poll_until(&what, policy, &self.cancel, move || async move {
            let obj = self
                .store
                .get(kind, namespace, name)
                .await
                .map_err(condition_error)?;

            let status = obj.data.get("status").unwrap_or(&Value::Null);
            if all_injected(status) {
                return Ok(true);
            }
            Err(ConditionError::retryable(match extract_message(status) {
                Some(msg) => format!("{} not injected yet: {}", name, msg),
                None => format!("{} not injected yet", name),
            }))
        })
        .await?;

        handle.advance(FaultPhase::Active);
        info!(fault = %handle.name(), "Fault is active");
        Ok(())
    }

    /// Delete the fault object. Does not wait for the fault's effects to end.
    #[instrument(skip(self, handle), fields(fault = %handle.name()))]
    pub async fn remove(&self, handle: &mut FaultHandle) -> Result<(), FaultError> {
        if handle.phase() == FaultPhase::Removed {
            debug!("Fault already removed");
            return Ok(());
        }

        match self
            .store
            .delete(handle.kind(), handle.namespace(), handle.name())
            .await
        {
            Ok(()) => info!(fault = %handle.name(), "Removed fault"),
            Err(e) if is_not_found(&e) => {
                warn!(fault = %handle.name(), "Fault not found (already deleted?)");
            }
            Err(e) => return Err(FaultError::Kube(e)),
        }

        handle.advance(FaultPhase::Removed);
        counter!("harness_faults_removed_total", 1, "kind" => handle.kind().to_string());
        Ok(())
    }

    /// Current status of a fault object
    pub async fn status(&self, handle: &FaultHandle) -> Result<FaultStatus, FaultError> {
        let obj = self
            .store
            .get(handle.kind(), handle.namespace(), handle.name())
            .await?;
        Ok(to_status(handle.kind(), obj))
    }

    /// Statuses of every fault created under this lifecycle's prefix
    pub async fn list(&self) -> Result<Vec<FaultStatus>, FaultError> {
        let selector = run_selector(&self.prefix);
        let mut statuses = Vec::new();
        for kind in [FaultKind::PodChaos, FaultKind::NetworkChaos] {
            let objects = self.store.list(kind, &self.namespace, &selector).await?;
            statuses.extend(objects.into_iter().map(|obj| to_status(kind, obj)));
        }
        Ok(statuses)
    }

    /// Delete every fault left behind under this prefix, e.g. by a crashed
    /// run. Returns how many were deleted.
    ///
    /// Every fault is attempted; if any delete fails the result is
    /// [`FaultError::CleanupIncomplete`] naming the faults still present.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn cleanup(&self) -> Result<usize, FaultError> {
        let statuses = self.list().await?;
        let mut deleted = 0;
        let mut failed = Vec::new();

        for status in statuses {
            match self
                .store
                .delete(status.kind, &self.namespace, &status.name)
                .await
            {
                Ok(()) => deleted += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    warn!(fault = %status.name, error = %e, "Failed to delete fault");
                    failed.push((status.name, e));
                }
            }
        }

        info!(deleted, failed = failed.len(), "Cleaned up faults");
        if failed.is_empty() {
            Ok(deleted)
        } else {
            Err(FaultError::CleanupIncomplete { deleted, failed })
        }
    }

    fn fault_name(&self, spec: &FaultSpec) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.prefix, spec.action.chaos_action(), &id[..8])
    }
}

/// `true` when `status.conditions` has `AllInjected=True`
pub fn all_injected(status: &Value) -> bool {
    status
        .get("conditions")
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("AllInjected")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

fn to_status(kind: FaultKind, obj: DynamicObject) -> FaultStatus {
    let status = obj.data.get("status").unwrap_or(&Value::Null);
    FaultStatus {
        name: obj.metadata.name.clone().unwrap_or_default(),
        kind,
        all_injected: all_injected(status),
        target_pods: extract_target_pods(status),
        message: extract_message(status),
    }
}

/// Pods Chaos Mesh reports as selected, as `namespace/name`
fn extract_target_pods(status: &Value) -> Vec<String> {
    status
        .get("experiment")
        .and_then(|e| e.get("containerRecords"))
        .and_then(|r| r.as_array())
        .map(|records| {
            records
                .iter()
                .filter_map(|r| r.get("id").and_then(|id| id.as_str()))
                .map(|id| id.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// First condition message that says something
fn extract_message(status: &Value) -> Option<String> {
    status
        .get("conditions")
        .and_then(|c| c.as_array())?
        .iter()
        .filter_map(|c| c.get("message").and_then(|m| m.as_str()))
        .find(|m| !m.is_empty())
        .map(|s| s.to_string())
}
