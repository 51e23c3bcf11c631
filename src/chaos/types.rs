//! Fault specs, handles and lifecycle phases

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Chaos Mesh API group/version used for all fault objects
pub const CHAOS_MESH_GROUP: &str = "chaos-mesh.org";
pub const CHAOS_MESH_VERSION: &str = "v1alpha1";

/// Kind of Chaos Mesh CRD backing a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum FaultKind {
    PodChaos,
    NetworkChaos,
}

impl FaultKind {
    pub fn plural(&self) -> &'static str {
        match self {
            FaultKind::PodChaos => "podchaos",
            FaultKind::NetworkChaos => "networkchaos",
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: CHAOS_MESH_GROUP.to_string(),
            version: CHAOS_MESH_VERSION.to_string(),
            api_version: format!("{}/{}", CHAOS_MESH_GROUP, CHAOS_MESH_VERSION),
            kind: self.to_string(),
            plural: self.plural().to_string(),
        }
    }
}

/// Direction of traffic affected by a network fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Outgoing traffic of the selected pods
    #[default]
    To,
    /// Incoming traffic
    From,
    Both,
}

/// What the fault does to the selected pods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultAction {
    PodKill { grace_period: Option<i64> },
    PodFailure,
    ContainerKill { containers: Vec<String> },
    /// Drop all traffic in `direction`
    Partition,
    Delay { latency: String, jitter: Option<String> },
    /// Packet loss percentage, e.g. "25"
    Loss { percent: String },
}

impl FaultAction {
    pub fn kind(&self) -> FaultKind {
        match self {
            FaultAction::PodKill { .. }
            | FaultAction::PodFailure
            | FaultAction::ContainerKill { .. } => FaultKind::PodChaos,
            FaultAction::Partition | FaultAction::Delay { .. } | FaultAction::Loss { .. } => {
                FaultKind::NetworkChaos
            }
        }
    }

    /// Value of `spec.action` in the Chaos Mesh object
    pub fn chaos_action(&self) -> &'static str {
        match self {
            FaultAction::PodKill { .. } => "pod-kill",
            FaultAction::PodFailure => "pod-failure",
            FaultAction::ContainerKill { .. } => "container-kill",
            FaultAction::Partition => "partition",
            FaultAction::Delay { .. } => "delay",
            FaultAction::Loss { .. } => "loss",
        }
    }
}

/// How many of the selected pods are affected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorMode {
    #[default]
    One,
    All,
    Fixed(u32),
    FixedPercent(u32),
    RandomMaxPercent(u32),
}

impl SelectorMode {
    /// `(mode, value)` as Chaos Mesh spells them
    pub fn chaos_mode(&self) -> (&'static str, Option<String>) {
        match self {
            SelectorMode::One => ("one", None),
            SelectorMode::All => ("all", None),
            SelectorMode::Fixed(n) => ("fixed", Some(n.to_string())),
            SelectorMode::FixedPercent(p) => ("fixed-percent", Some(p.to_string())),
            SelectorMode::RandomMaxPercent(p) => ("random-max-percent", Some(p.to_string())),
        }
    }
}

/// Pods a fault applies to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaultSelector {
    pub namespaces: Vec<String>,
    pub label_selectors: BTreeMap<String, String>,
    /// Explicit pod names per namespace
    pub pods: BTreeMap<String, Vec<String>>,
}

impl FaultSelector {
    /// Select by labels within one namespace
    pub fn labels<I, K, V>(namespace: &str, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            namespaces: vec![namespace.to_string()],
            label_selectors: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            pods: BTreeMap::new(),
        }
    }

    /// Select named pods within one namespace
    pub fn pods<I, S>(namespace: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pods = BTreeMap::new();
        pods.insert(
            namespace.to_string(),
            names.into_iter().map(Into::into).collect(),
        );
        Self {
            namespaces: vec![namespace.to_string()],
            label_selectors: BTreeMap::new(),
            pods,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.label_selectors.is_empty() && self.pods.values().all(Vec::is_empty)
    }
}

/// Peer side of a network fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultTarget {
    pub selector: FaultSelector,
    pub mode: SelectorMode,
}

/// Everything needed to submit one fault object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub action: FaultAction,
    pub mode: SelectorMode,
    pub selector: FaultSelector,
    /// Chaos Mesh duration string ("30s", "5m"); unset runs until removed
    pub duration: Option<String>,
    /// Network faults only
    pub direction: Direction,
    /// Network faults only
    pub target: Option<FaultTarget>,
}

impl FaultSpec {
    pub fn new(action: FaultAction, selector: FaultSelector) -> Self {
        Self {
            action,
            mode: SelectorMode::default(),
            selector,
            duration: None,
            direction: Direction::default(),
            target: None,
        }
    }

    pub fn pod_kill(selector: FaultSelector) -> Self {
        Self::new(FaultAction::PodKill { grace_period: None }, selector)
    }

    /// Cut traffic between `selector` and `target` in both directions
    pub fn partition(selector: FaultSelector, target: FaultSelector) -> Self {
        Self::new(FaultAction::Partition, selector)
            .with_direction(Direction::Both)
            .with_target(target, SelectorMode::All)
    }

    pub fn with_mode(mut self, mode: SelectorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_target(mut self, selector: FaultSelector, mode: SelectorMode) -> Self {
        self.target = Some(FaultTarget { selector, mode });
        self
    }

    pub fn kind(&self) -> FaultKind {
        self.action.kind()
    }

    /// Reject specs Chaos Mesh would refuse or that would hit too much
    pub fn validate(&self) -> Result<(), String> {
        if self.selector.is_empty() {
            return Err("selector must name labels or pods".to_string());
        }
        validate_mode(&self.mode)?;

        if let FaultAction::ContainerKill { containers } = &self.action {
            if containers.is_empty() {
                return Err("container-kill needs at least one container name".to_string());
            }
        }

        match (&self.target, self.kind()) {
            (Some(_), FaultKind::PodChaos) => {
                Err(format!("{} does not take a target", self.action.chaos_action()))
            }
            (Some(target), FaultKind::NetworkChaos) => {
                if target.selector.is_empty() {
                    return Err("target selector must name labels or pods".to_string());
                }
                validate_mode(&target.mode)
            }
            (None, _) => Ok(()),
        }
    }
}

fn validate_mode(mode: &SelectorMode) -> Result<(), String> {
    match *mode {
        SelectorMode::Fixed(0) => Err("fixed mode needs at least one pod".to_string()),
        SelectorMode::FixedPercent(p) | SelectorMode::RandomMaxPercent(p) if p == 0 || p > 100 => {
            Err(format!("percentage {} outside 1..=100", p))
        }
        _ => Ok(()),
    }
}

/// Lifecycle phase of a submitted fault.
///
/// Ordered: a handle only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FaultPhase {
    Created,
    Active,
    Removed,
}

/// Reference to a submitted fault object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultHandle {
    name: String,
    namespace: String,
    kind: FaultKind,
    phase: FaultPhase,
    created_at: DateTime<Utc>,
}

impl FaultHandle {
    pub(crate) fn new(name: String, namespace: String, kind: FaultKind) -> Self {
        Self {
            name,
            namespace,
            kind,
            phase: FaultPhase::Created,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn phase(&self) -> FaultPhase {
        self.phase
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Move to `next` if it is later than the current phase
    pub(crate) fn advance(&mut self, next: FaultPhase) -> bool {
        if next > self.phase {
            self.phase = next;
            true
        } else {
            false
        }
    }
}

/// Snapshot of a fault object's status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultStatus {
    pub name: String,
    pub kind: FaultKind,
    pub all_injected: bool,
    pub target_pods: Vec<String>,
    pub message: Option<String>,
}
