//! Stack ids and mixins.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Any stack id is accepted by a module declaring this one.
pub const WILDCARD_STACK_ID: &str = "*";

const BUILD_PREFIX: &str = "build:";
const RUN_PREFIX: &str = "run:";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixins: Vec<String>,
}

impl Stack {
    pub fn new(id: impl Into<String>, mixins: &[&str]) -> Self {
        Self {
            id: id.into(),
            mixins: mixins.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Stacks present in both inputs, each carrying the sorted union of its mixins.
/// Output is ordered by stack id.
pub fn merge_compatible(a: &[Stack], b: &[Stack]) -> Vec<Stack> {
    let mut left: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for stack in a {
        left.entry(stack.id.as_str())
            .or_default()
            .extend(stack.mixins.iter().map(String::as_str));
    }

    let mut merged: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for stack in b {
        if let Some(mixins) = left.get(stack.id.as_str()) {
            let entry = merged.entry(stack.id.as_str()).or_default();
            entry.extend(mixins.iter().copied());
            entry.extend(stack.mixins.iter().map(String::as_str));
        }
    }

    merged
        .into_iter()
        .map(|(id, mixins)| Stack {
            id: id.to_string(),
            mixins: mixins.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

pub fn is_build_only(mixin: &str) -> bool {
    mixin.starts_with(BUILD_PREFIX)
}

pub fn is_run_only(mixin: &str) -> bool {
    mixin.starts_with(RUN_PREFIX)
}

/// Mixins a build-time image must provide: everything except `run:` mixins.
pub fn build_mixins(mixins: &[String]) -> Vec<String> {
    mixins.iter().filter(|m| !is_run_only(m)).cloned().collect()
}

/// Required mixins missing from `provided`, in requirement order. `run:`
/// mixins are only checked when `validate_run_stage` is set.
pub fn missing_mixins(required: &[String], provided: &[String], validate_run_stage: bool) -> Vec<String> {
    let provided: BTreeSet<&str> = provided.iter().map(String::as_str).collect();
    required
        .iter()
        .filter(|m| validate_run_stage || !is_run_only(m))
        .filter(|m| !provided.contains(m.as_str()))
        .cloned()
        .collect()
}
