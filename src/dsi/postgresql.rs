//! PostgreSQL instances managed by the a8s operator

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use super::service::DataService;
use super::DataServiceError;

pub const POSTGRESQL_KIND: &str = "postgresql";

const GROUP: &str = "postgresql.anynines.com";
const VERSION: &str = "v1beta3";

const DSI_NAME_LABEL: &str = "a8s.a9s/dsi-name";
const ROLE_LABEL: &str = "a8s.a9s/replication-role";

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgreSql;

impl PostgreSql {
    fn defaults() -> Value {
        json!({
            "replicas": 1,
            "version": 14,
            "volumeSize": "1Gi",
        })
    }
}

impl DataService for PostgreSql {
    fn kind(&self) -> &'static str {
        POSTGRESQL_KIND
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: GROUP.to_string(),
            version: VERSION.to_string(),
            api_version: format!("{}/{}", GROUP, VERSION),
            kind: "Postgresql".to_string(),
            plural: "postgresqls".to_string(),
        }
    }

    fn client_object(
        &self,
        name: &str,
        namespace: &str,
        spec: &Value,
    ) -> Result<DynamicObject, DataServiceError> {
        let mut merged = Self::defaults();
        match spec {
            Value::Null => {}
            Value::Object(overrides) => {
                for (key, value) in overrides {
                    merged[key.as_str()] = value.clone();
                }
            }
            other => {
                return Err(DataServiceError::InvalidSpec(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        }

        let replicas = merged["replicas"].as_i64().unwrap_or(0);
        if replicas < 1 {
            return Err(DataServiceError::InvalidSpec(format!(
                "replicas must be at least 1, got {}",
                merged["replicas"]
            )));
        }

        let manifest = json!({
            "apiVersion": format!("{}/{}", GROUP, VERSION),
            "kind": "Postgresql",
            "metadata": {
                "name": name,
                "namespace": namespace,
            },
            "spec": merged,
        });
        Ok(serde_json::from_value(manifest)?)
    }

    fn cluster_status(&self, obj: &DynamicObject) -> Option<String> {
        obj.data
            .get("status")
            .and_then(|s| s.get("clusterStatus"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
    }

    fn is_ready(&self, obj: &DynamicObject) -> bool {
        if self.cluster_status(obj).as_deref() != Some("Running") {
            return false;
        }
        let desired = obj
            .data
            .get("spec")
            .and_then(|s| s.get("replicas"))
            .and_then(|r| r.as_i64())
            .unwrap_or(1);
        let ready = obj
            .data
            .get("status")
            .and_then(|s| s.get("readyReplicas"))
            .and_then(|r| r.as_i64())
            .unwrap_or(0);
        ready >= desired
    }

    fn primary_selector(&self, name: &str) -> String {
        format!("{}={},{}=master", DSI_NAME_LABEL, name, ROLE_LABEL)
    }

    fn replica_selector(&self, name: &str) -> String {
        format!("{}={},{}=replica", DSI_NAME_LABEL, name, ROLE_LABEL)
    }
}
