//! Chaos Mesh manifest builders
//!
//! Renders a [`FaultSpec`] as the `PodChaos`/`NetworkChaos` object Chaos Mesh
//! expects.

use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

use super::types::{
    FaultAction, FaultKind, FaultSelector, FaultSpec, SelectorMode, CHAOS_MESH_GROUP,
    CHAOS_MESH_VERSION,
};

/// Set on every object this crate creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "dsi-harness";
/// Run prefix, used by cleanup to find leftovers
pub const RUN_LABEL: &str = "dsi-harness.io/run";

/// Label selector matching every fault created under `prefix`
pub fn run_selector(prefix: &str) -> String {
    format!("{}={},{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE, RUN_LABEL, prefix)
}

/// Build the manifest as JSON
pub fn fault_manifest(name: &str, namespace: &str, prefix: &str, spec: &FaultSpec) -> Value {
    let mut body = Map::new();
    body.insert("action".into(), json!(spec.action.chaos_action()));
    insert_mode(&mut body, &spec.mode);
    body.insert("selector".into(), selector_json(&spec.selector));

    if let Some(duration) = &spec.duration {
        body.insert("duration".into(), json!(duration));
    }

    match &spec.action {
        FaultAction::PodKill { grace_period } => {
            if let Some(period) = grace_period {
                body.insert("gracePeriod".into(), json!(period));
            }
        }
        FaultAction::PodFailure => {}
        FaultAction::ContainerKill { containers } => {
            body.insert("containerNames".into(), json!(containers));
        }
        FaultAction::Partition => {}
        FaultAction::Delay { latency, jitter } => {
            let mut delay = json!({ "latency": latency });
            if let Some(jitter) = jitter {
                delay["jitter"] = json!(jitter);
            }
            body.insert("delay".into(), delay);
        }
        FaultAction::Loss { percent } => {
            body.insert("loss".into(), json!({ "loss": percent }));
        }
    }

    if spec.kind() == FaultKind::NetworkChaos {
        body.insert("direction".into(), json!(spec.direction.to_string()));
        if let Some(target) = &spec.target {
            let mut target_json = Map::new();
            insert_mode(&mut target_json, &target.mode);
            target_json.insert("selector".into(), selector_json(&target.selector));
            body.insert("target".into(), Value::Object(target_json));
        }
    }

    json!({
        "apiVersion": format!("{}/{}", CHAOS_MESH_GROUP, CHAOS_MESH_VERSION),
        "kind": spec.kind().to_string(),
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {
                MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                RUN_LABEL: prefix,
            }
        },
        "spec": Value::Object(body),
    })
}

/// Build the manifest as a [`DynamicObject`] ready for `Api::create`
pub fn fault_object(
    name: &str,
    namespace: &str,
    prefix: &str,
    spec: &FaultSpec,
) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(fault_manifest(name, namespace, prefix, spec))
}

fn insert_mode(obj: &mut Map<String, Value>, mode: &SelectorMode) {
    let (mode, value) = mode.chaos_mode();
    obj.insert("mode".into(), json!(mode));
    if let Some(value) = value {
        obj.insert("value".into(), json!(value));
    }
}

fn selector_json(selector: &FaultSelector) -> Value {
    let mut out = Map::new();
    if !selector.namespaces.is_empty() {
        out.insert("namespaces".into(), json!(selector.namespaces));
    }
    if !selector.label_selectors.is_empty() {
        out.insert("labelSelectors".into(), json!(selector.label_selectors));
    }
    if !selector.pods.is_empty() {
        out.insert("pods".into(), json!(selector.pods));
    }
    Value::Object(out)
}
