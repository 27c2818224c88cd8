// # Version Diff
//
// Structured comparison of two policy versions: added, modified, and removed
// content paths with a change complexity inferred from what moved.

use crate::error::{Result, VaultError};
use crate::policy::{PolicyVersion, PolicyVersionStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How disruptive the change between two versions is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeComplexity {
    Simple,
    Complex,
    Breaking,
}

/// Structured diff between two versions of a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDiff {
    pub policy_id: String,
    pub from_version: String,
    pub to_version: String,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub complexity: ChangeComplexity,
}

impl VersionDiff {
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Compare two stored versions of a policy.
pub fn diff_versions(
    store: &PolicyVersionStore,
    policy_id: &str,
    from: &str,
    to: &str,
) -> Result<VersionDiff> {
    let from_version = store
        .get_version(policy_id, from)
        .ok_or_else(|| VaultError::NotFound(format!("policy {} version {}", policy_id, from)))?;
    let to_version = store
        .get_version(policy_id, to)
        .ok_or_else(|| VaultError::NotFound(format!("policy {} version {}", policy_id, to)))?;
    diff_artifacts(&from_version, &to_version)
}

/// Compare two version artifacts directly.
pub fn diff_artifacts(from: &PolicyVersion, to: &PolicyVersion) -> Result<VersionDiff> {
    let from_paths = flatten_content(&serde_json::to_value(&from.content)?);
    let to_paths = flatten_content(&serde_json::to_value(&to.content)?);

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut removed = Vec::new();

    for (path, value) in &to_paths {
        match from_paths.get(path) {
            None => added.push(path.clone()),
            Some(prior) if prior != value => modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in from_paths.keys() {
        if !to_paths.contains_key(path) {
            removed.push(path.clone());
        }
    }

    let enforcement_changed =
        from.content.config.enforcement != to.content.config.enforcement;
    let rules_removed = removed.iter().any(|path| path.starts_with("rules"));

    let complexity = if enforcement_changed {
        ChangeComplexity::Breaking
    } else if rules_removed {
        ChangeComplexity::Complex
    } else {
        ChangeComplexity::Simple
    };

    Ok(VersionDiff {
        policy_id: from.policy_id.clone(),
        from_version: from.version.clone(),
        to_version: to.version.clone(),
        added,
        modified,
        removed,
        complexity,
    })
}

fn flatten_content(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&path, child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(&format!("{}[{}]", prefix, index), child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}
