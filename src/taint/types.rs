//! Taint, toleration and taint-set types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1 as core;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::algebra::TaintConflict;
use super::TaintError;

/// Taint keys marking control-plane nodes
pub const CONTROL_PLANE_TAINT_KEYS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A single node taint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            effect,
        }
    }

    /// A taint with a key and effect but no value
    pub fn keyed(key: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: None,
            effect,
        }
    }

    pub fn is_control_plane(&self) -> bool {
        CONTROL_PLANE_TAINT_KEYS.contains(&self.key.as_str())
    }

    fn value_part(&self) -> TaintValue {
        TaintValue {
            value: self.value.clone(),
            effect: self.effect,
        }
    }
}

/// Formats as `key=value:Effect`, or `key:Effect` without a value
impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}:{}", self.key, value, self.effect),
            None => write!(f, "{}:{}", self.key, self.effect),
        }
    }
}

impl FromStr for Taint {
    type Err = TaintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, effect) = s
            .rsplit_once(':')
            .ok_or_else(|| TaintError::Parse(s.to_string()))?;
        let effect = effect
            .parse::<TaintEffect>()
            .map_err(|_| TaintError::Parse(s.to_string()))?;
        let (key, value) = match head.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (head, None),
        };
        if key.is_empty() {
            return Err(TaintError::Parse(s.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value,
            effect,
        })
    }
}

impl From<&Taint> for core::Taint {
    fn from(taint: &Taint) -> Self {
        core::Taint {
            key: taint.key.clone(),
            value: taint.value.clone(),
            effect: taint.effect.to_string(),
            time_added: None,
        }
    }
}

impl TryFrom<&core::Taint> for Taint {
    type Error = TaintError;

    fn try_from(taint: &core::Taint) -> Result<Self, Self::Error> {
        let effect = taint
            .effect
            .parse::<TaintEffect>()
            .map_err(|_| TaintError::InvalidEffect {
                key: taint.key.clone(),
                effect: taint.effect.clone(),
            })?;
        Ok(Self {
            key: taint.key.clone(),
            value: taint.value.clone().filter(|v| !v.is_empty()),
            effect,
        })
    }
}

/// The (value, effect) half of a taint, as stored per key in a [`NodeTaintSet`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaintValue {
    pub value: Option<String>,
    pub effect: TaintEffect,
}

impl fmt::Display for TaintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.value.as_deref().unwrap_or("<none>"),
            self.effect
        )
    }
}

/// Taints of one node, unique per key
///
/// Backed by a `BTreeMap` so iteration order, and therefore the taint list
/// written back to the node, is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTaintSet {
    entries: BTreeMap<String, TaintValue>,
}

impl NodeTaintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, collapsing exact duplicates.
    ///
    /// Two taints with the same key but different (value, effect) cannot
    /// share a set and are reported as a conflict.
    pub fn from_taints<'a, I>(taints: I) -> Result<Self, TaintConflict>
    where
        I: IntoIterator<Item = &'a Taint>,
    {
        let mut set = Self::new();
        for taint in taints {
            set.insert_checked(taint)?;
        }
        Ok(set)
    }

    /// Read the taints of a Kubernetes node
    pub fn from_node(node: &core::Node) -> Result<Self, TaintError> {
        let raw = node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let taints = raw
            .iter()
            .map(Taint::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_taints(&taints)?)
    }

    pub(crate) fn insert_checked(&mut self, taint: &Taint) -> Result<(), TaintConflict> {
        let requested = taint.value_part();
        match self.entries.get(&taint.key) {
            Some(existing) if *existing != requested => Err(TaintConflict {
                key: taint.key.clone(),
                existing: existing.clone(),
                requested,
            }),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(taint.key.clone(), requested);
                Ok(())
            }
        }
    }

    pub(crate) fn remove_key(&mut self, key: &str) -> Option<TaintValue> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&TaintValue> {
        self.entries.get(key)
    }

    /// True when the set holds exactly this taint
    pub fn contains(&self, taint: &Taint) -> bool {
        self.entries
            .get(&taint.key)
            .is_some_and(|v| *v == taint.value_part())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the node carries a control-plane/master role taint
    pub fn is_control_plane(&self) -> bool {
        CONTROL_PLANE_TAINT_KEYS
            .iter()
            .any(|key| self.entries.contains_key(*key))
    }

    pub fn iter(&self) -> impl Iterator<Item = Taint> + '_ {
        self.entries.iter().map(|(key, v)| Taint {
            key: key.clone(),
            value: v.value.clone(),
            effect: v.effect,
        })
    }

    pub fn to_vec(&self) -> Vec<Taint> {
        self.iter().collect()
    }

    /// Render as the `spec.taints` list of a node
    pub fn to_k8s(&self) -> Vec<core::Taint> {
        self.iter().map(|t| core::Taint::from(&t)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum TolerationOperator {
    Equal,
    Exists,
}

/// A pod toleration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates every taint
    pub key: Option<String>,
    pub operator: TolerationOperator,
    pub value: Option<String>,
    /// `None` matches every effect
    pub effect: Option<TaintEffect>,
    pub toleration_seconds: Option<i64>,
}

impl Toleration {
    /// The exact toleration for one taint
    pub fn for_taint(taint: &Taint) -> Self {
        Self {
            key: Some(taint.key.clone()),
            operator: TolerationOperator::Equal,
            value: taint.value.clone(),
            effect: Some(taint.effect),
            toleration_seconds: None,
        }
    }

    /// Tolerate any value of `key`
    pub fn exists(key: impl Into<String>, effect: Option<TaintEffect>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Exists,
            value: None,
            effect,
            toleration_seconds: None,
        }
    }

    /// Kubernetes toleration matching rules
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }

        let key = self.key.as_deref().unwrap_or_default();
        if key.is_empty() {
            return self.operator == TolerationOperator::Exists;
        }
        if key != taint.key {
            return false;
        }

        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => {
                self.value.as_deref().unwrap_or_default()
                    == taint.value.as_deref().unwrap_or_default()
            }
        }
    }
}

impl From<&Toleration> for core::Toleration {
    fn from(t: &Toleration) -> Self {
        core::Toleration {
            key: t.key.clone(),
            operator: Some(t.operator.to_string()),
            value: t.value.clone(),
            effect: t.effect.map(|e| e.to_string()),
            toleration_seconds: t.toleration_seconds,
        }
    }
}

/// Tolerations a workload needs to schedule onto nodes carrying `set`
pub fn tolerations_for(set: &NodeTaintSet) -> Vec<Toleration> {
    set.iter().map(|t| Toleration::for_taint(&t)).collect()
}

/// True when every `NoSchedule`/`NoExecute` taint in `set` is tolerated
pub fn schedulable_with(set: &NodeTaintSet, tolerations: &[Toleration]) -> bool {
    set.iter()
        .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
        .all(|t| tolerations.iter().any(|tol| tol.tolerates(&t)))
}
