//! The data service capability trait

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;

use super::DataServiceError;

/// What the harness needs to know about one kind of data service instance
pub trait DataService: Send + Sync {
    /// Registry key, e.g. `postgresql`
    fn kind(&self) -> &'static str;

    /// API resource of the instance custom object
    fn api_resource(&self) -> ApiResource;

    /// Instance object to submit for `name`.
    ///
    /// `spec` is merged over the kind's defaults; it must be a JSON object
    /// or null.
    fn client_object(
        &self,
        name: &str,
        namespace: &str,
        spec: &Value,
    ) -> Result<DynamicObject, DataServiceError>;

    /// Status string the operator reports, if any
    fn cluster_status(&self, obj: &DynamicObject) -> Option<String>;

    /// `true` once the instance is serving on all replicas
    fn is_ready(&self, obj: &DynamicObject) -> bool;

    /// Label selector for the pod currently acting as primary
    fn primary_selector(&self, name: &str) -> String;

    /// Label selector for the replica pods
    fn replica_selector(&self, name: &str) -> String;
}
