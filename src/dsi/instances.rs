//! Creating, deleting and waiting on data service instances

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::service::DataService;
use super::DataServiceError;
use crate::k8s::{condition_error, is_not_found};
use crate::poll::{poll_until, CancelToken, ConditionError, PollPolicy};

/// Access to instance objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error>;
}

/// [`InstanceStore`] backed by the cluster API
#[derive(Clone)]
pub struct KubeInstanceStore {
    client: Client,
}

impl KubeInstanceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl InstanceStore for KubeInstanceStore {
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(resource, namespace)
            .create(&PostParams::default(), obj)
            .await
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(resource, namespace).get(name).await
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}

/// Instances of one data service kind in one namespace
pub struct DataServiceInstances<S = KubeInstanceStore> {
    service: Arc<dyn DataService>,
    store: S,
    namespace: String,
    cancel: CancelToken,
}

impl DataServiceInstances<KubeInstanceStore> {
    pub fn from_client(client: Client, service: Arc<dyn DataService>, namespace: &str) -> Self {
        Self::new(KubeInstanceStore::new(client), service, namespace)
    }
}

impl<S: InstanceStore> DataServiceInstances<S> {
    pub fn new(store: S, service: Arc<dyn DataService>, namespace: &str) -> Self {
        Self {
            service,
            store,
            namespace: namespace.to_string(),
            cancel: CancelToken::new(),
        }
    }

    /// Cancelling `cancel` aborts any running wait
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn service(&self) -> &dyn DataService {
        self.service.as_ref()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self, spec), fields(kind = self.service.kind()))]
    pub async fn create(&self, name: &str, spec: &Value) -> Result<DynamicObject, DataServiceError> {
        let obj = self.service.client_object(name, &self.namespace, spec)?;
        let created = self
            .store
            .create(&self.service.api_resource(), &self.namespace, &obj)
            .await?;
        info!(name, namespace = %self.namespace, "Created data service instance");
        Ok(created)
    }

    pub async fn get(&self, name: &str) -> Result<DynamicObject, DataServiceError> {
        Ok(self
            .store
            .get(&self.service.api_resource(), &self.namespace, name)
            .await?)
    }

    /// Delete an instance; a missing instance is not an error
    #[instrument(skip(self), fields(kind = self.service.kind()))]
    pub async fn delete(&self, name: &str) -> Result<(), DataServiceError> {
        match self
            .store
            .delete(&self.service.api_resource(), &self.namespace, name)
            .await
        {
            Ok(()) => {
                info!(name, "Deleted data service instance");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                warn!(name, "Data service instance not found (already deleted?)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the instance reports ready. A missing instance counts as
    /// not ready yet.
    #[instrument(skip(self, policy), fields(kind = self.service.kind()))]
    pub async fn wait_ready(&self, name: &str, policy: PollPolicy) -> Result<(), DataServiceError> {
        let what = format!("{} {} to become ready", self.service.kind(), name);
        let resource = self.service.api_resource();
        let (resource, service) = (&resource, self.service.as_ref());

        poll_until(&what, policy, &self.cancel, move || async move {
            let obj = self
                .store
                .get(resource, &self.namespace, name)
                .await
                .map_err(condition_error)?;
            if service.is_ready(&obj) {
                return Ok(true);
            }
            Err(ConditionError::retryable(match service.cluster_status(&obj) {
                Some(status) => format!("{} is {}", name, status),
                None => format!("{} has no status yet", name),
            }))
        })
        .await?;

        info!(name, "Data service instance is ready");
        Ok(())
    }

    /// Wait until the instance object is gone
    #[instrument(skip(self, policy), fields(kind = self.service.kind()))]
    pub async fn wait_deleted(
        &self,
        name: &str,
        policy: PollPolicy,
    ) -> Result<(), DataServiceError> {
        let what = format!("{} {} to be deleted", self.service.kind(), name);
        let resource = self.service.api_resource();
        let resource = &resource;

        poll_until(&what, policy, &self.cancel, move || async move {
            match self.store.get(resource, &self.namespace, name).await {
                Ok(_) => Err(ConditionError::retryable(format!("{} still exists", name))),
                Err(e) if is_not_found(&e) => Ok(true),
                Err(e) => Err(condition_error(e)),
            }
        })
        .await?;

        info!(name, "Data service instance deleted");
        Ok(())
    }
}
