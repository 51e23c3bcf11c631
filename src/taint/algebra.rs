//! Union and difference over node taint sets
//!
//! Neither operation resolves ambiguity: a key already present with a
//! different (value, effect) is a [`TaintConflict`], never an overwrite.

use thiserror::Error;

use super::types::{NodeTaintSet, TaintValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("taint key '{key}' is set to {existing}, refusing to treat it as {requested}")]
pub struct TaintConflict {
    pub key: String,
    pub existing: TaintValue,
    pub requested: TaintValue,
}

/// Add every taint of `to_add` to `existing`.
///
/// Taints already present with the same (value, effect) are no-ops.
pub fn union(existing: &NodeTaintSet, to_add: &NodeTaintSet) -> Result<NodeTaintSet, TaintConflict> {
    let mut merged = existing.clone();
    for taint in to_add.iter() {
        merged.insert_checked(&taint)?;
    }
    Ok(merged)
}

/// Remove every taint of `to_remove` from `existing`.
///
/// Keys absent from `existing` are skipped. A key present with a different
/// (value, effect) is refused rather than removed.
pub fn diff(existing: &NodeTaintSet, to_remove: &NodeTaintSet) -> Result<NodeTaintSet, TaintConflict> {
    let mut remainder = existing.clone();
    for taint in to_remove.iter() {
        let Some(current) = existing.get(&taint.key) else {
            continue;
        };
        if !existing.contains(&taint) {
            return Err(TaintConflict {
                key: taint.key.clone(),
                existing: current.clone(),
                requested: TaintValue {
                    value: taint.value.clone(),
                    effect: taint.effect,
                },
            });
        }
        remainder.remove_key(&taint.key);
    }
    Ok(remainder)
}
