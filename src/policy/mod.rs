// # Policy Module
//
// Versioned policy artifacts, the decision point that evaluates intents
// against them, and the atomic transaction engine that mutates them.
//
// ## Lifecycle
//
// ```text
// DRAFT ──approve──▶ APPROVED ──deploy──▶ ACTIVE ──▶ ARCHIVED
//                                           │
//                                 restore   ▼
//                                      ROLLBACK_TARGET (new ACTIVE)
// ```
//
// At most one ACTIVE version exists per policy id at any observable instant.

pub mod atomic;
pub mod diff;
pub mod engine;
pub mod store;

pub use atomic::{
    AtomicPolicyExecutor, AtomicTransaction, OperationKind, OperationResult, PolicyOperation,
    TransactionState,
};
pub use diff::{ChangeComplexity, VersionDiff};
pub use engine::PolicyDecisionPoint;
pub use store::{PolicyChange, PolicyVersionStore};

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enforcement mode of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Enforcement {
    Blocking,
    Warning,
    Advisory,
}

/// Kind of change a new version represents; drives the semver bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Creation,
    Update,
    Major,
    Breaking,
}

/// Version lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    Draft,
    Approved,
    Active,
    RollbackTarget,
    Archived,
}

/// Comparison operator in a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    Exists,
}

/// Structured condition tree evaluated over the intent's JSON rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Condition {
    Always,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

impl Condition {
    /// Evaluate against an intent rendered as JSON. Unknown fields are not
    /// an error: `Exists` answers false, comparisons answer false.
    pub fn evaluate(&self, intent: &Value) -> Result<bool> {
        match self {
            Condition::Always => Ok(true),
            Condition::Compare { field, op, value } => {
                let actual = lookup_path(intent, field);
                Ok(compare(actual, *op, value))
            }
            Condition::All { conditions } => {
                for condition in conditions {
                    if !condition.evaluate(intent)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any { conditions } => {
                for condition in conditions {
                    if condition.evaluate(intent)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!condition.evaluate(intent)?),
        }
    }
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

fn compare(actual: Option<&Value>, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Exists => actual.is_some(),
        CompareOp::Eq => actual.map(|a| a == expected).unwrap_or(false),
        CompareOp::Ne => actual.map(|a| a != expected).unwrap_or(false),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let (Some(a), Some(b)) = (actual.and_then(Value::as_f64), expected.as_f64()) else {
                return false;
            };
            match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                _ => unreachable!(),
            }
        }
        CompareOp::In => expected
            .as_array()
            .and_then(|items| actual.map(|a| items.contains(a)))
            .unwrap_or(false),
        CompareOp::Contains => match actual {
            Some(Value::Array(items)) => items.contains(expected),
            Some(Value::String(s)) => expected.as_str().map(|e| s.contains(e)).unwrap_or(false),
            _ => false,
        },
    }
}

/// What a matched (or failed) rule does to the policy outcome.
///
/// `Allow` rules are requirements: the condition must hold or the policy
/// denies. `Deny` rules forbid: the condition holding denies. `Conditional`
/// rules attach conditions and obligations when the condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyRuleKind {
    Allow,
    Deny,
    Conditional,
}

/// One rule inside a policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub kind: PolicyRuleKind,
    pub condition: Condition,
    pub reason: String,
    #[serde(default)]
    pub conditions: Vec<crate::intent::DecisionCondition>,
    #[serde(default)]
    pub obligations: Vec<crate::intent::Obligation>,
}

/// Policy configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub enforcement: Enforcement,
    /// Operations this policy applies to; empty means all.
    pub scope: Vec<String>,
    /// Higher priority evaluates first.
    pub priority: i32,
    pub jurisdictions: Vec<String>,
    pub compliance_frameworks: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enforcement: Enforcement::Blocking,
            scope: Vec::new(),
            priority: 0,
            jurisdictions: Vec::new(),
            compliance_frameworks: Vec::new(),
        }
    }
}

/// Versioned policy content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContent {
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub data: Value,
    pub config: PolicyConfig,
    /// Policy ids this policy depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Authoring metadata for a version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub title: String,
    pub description: String,
    pub category: String,
    pub severity: String,
    pub impact: String,
    pub change_type: Option<ChangeType>,
    pub release_notes: String,
    pub reviewers: Vec<String>,
    pub approved_by: Option<String>,
}

/// An immutable policy version artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersion {
    /// Globally unique version id.
    pub id: String,
    pub policy_id: String,
    /// Semver string.
    pub version: String,
    /// SHA-256 hex over the canonical content JSON.
    pub hash: String,
    pub content: PolicyContent,
    pub metadata: PolicyMetadata,
    pub parent_version: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub status: VersionStatus,
}

impl PolicyVersion {
    /// Whether the policy applies to an operation given its scope.
    pub fn in_scope(&self, operation: &str) -> bool {
        self.content.config.scope.is_empty()
            || self.content.config.scope.iter().any(|s| s == operation)
    }
}

/// Parse a semver string into (major, minor, patch).
pub fn parse_semver(version: &str) -> Result<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let mut next = |name: &str| -> Result<u64> {
        parts
            .next()
            .ok_or_else(|| VaultError::InvalidInput(format!("semver missing {}: {}", name, version)))?
            .parse()
            .map_err(|_| VaultError::InvalidInput(format!("semver invalid {}: {}", name, version)))
    };
    let major = next("major")?;
    let minor = next("minor")?;
    let patch = next("patch")?;
    if parts.next().is_some() {
        return Err(VaultError::InvalidInput(format!(
            "semver has trailing segments: {}",
            version
        )));
    }
    Ok((major, minor, patch))
}

/// Compute the next version from the latest and the change type.
///
/// Creation starts at 1.0.0, Update bumps the minor, Major and Breaking bump
/// the major. Patch bumps are never produced.
pub fn next_semver(latest: Option<&str>, change_type: ChangeType) -> Result<String> {
    match (latest, change_type) {
        (None, _) | (_, ChangeType::Creation) => Ok("1.0.0".to_string()),
        (Some(latest), ChangeType::Update) => {
            let (major, minor, _) = parse_semver(latest)?;
            Ok(format!("{}.{}.0", major, minor + 1))
        }
        (Some(latest), ChangeType::Major | ChangeType::Breaking) => {
            let (major, _, _) = parse_semver(latest)?;
            Ok(format!("{}.0.0", major + 1))
        }
    }
}

/// Semver precedence ordering.
pub fn compare_semver(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    Ok(parse_semver(a)?.cmp(&parse_semver(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_semver_bumps() {
        assert_eq!(next_semver(None, ChangeType::Creation).unwrap(), "1.0.0");
        assert_eq!(
            next_semver(Some("1.0.0"), ChangeType::Update).unwrap(),
            "1.1.0"
        );
        assert_eq!(
            next_semver(Some("1.4.0"), ChangeType::Breaking).unwrap(),
            "2.0.0"
        );
        assert_eq!(
            next_semver(Some("2.3.0"), ChangeType::Major).unwrap(),
            "3.0.0"
        );
    }

    #[test]
    fn test_semver_ordering() {
        assert_eq!(
            compare_semver("1.2.0", "1.10.0").unwrap(),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_semver("2.0.0", "1.99.0").unwrap(),
            std::cmp::Ordering::Greater
        );
    }

    #[test]
    fn test_semver_rejects_garbage() {
        assert!(parse_semver("1.2").is_err());
        assert!(parse_semver("1.2.x").is_err());
        assert!(parse_semver("1.2.3.4").is_err());
    }

    #[test]
    fn test_condition_compare() {
        let intent = json!({"financial": {"amount": 5000}});
        let under_limit = Condition::Compare {
            field: "financial.amount".to_string(),
            op: CompareOp::Lt,
            value: json!(10000),
        };
        assert!(under_limit.evaluate(&intent).unwrap());

        let over = json!({"financial": {"amount": 15000}});
        assert!(!under_limit.evaluate(&over).unwrap());
    }

    #[test]
    fn test_condition_missing_field() {
        let intent = json!({"financial": {}});
        let condition = Condition::Compare {
            field: "financial.amount".to_string(),
            op: CompareOp::Lt,
            value: json!(10000),
        };
        assert!(!condition.evaluate(&intent).unwrap());

        let exists = Condition::Compare {
            field: "financial.amount".to_string(),
            op: CompareOp::Exists,
            value: Value::Null,
        };
        assert!(!exists.evaluate(&intent).unwrap());
    }

    #[test]
    fn test_condition_combinators() {
        let intent = json!({"user": {"mfa": true}, "financial": {"amount": 500}});
        let condition = Condition::All {
            conditions: vec![
                Condition::Compare {
                    field: "user.mfa".to_string(),
                    op: CompareOp::Eq,
                    value: json!(true),
                },
                Condition::Not {
                    condition: Box::new(Condition::Compare {
                        field: "financial.amount".to_string(),
                        op: CompareOp::Gt,
                        value: json!(1000),
                    }),
                },
            ],
        };
        assert!(condition.evaluate(&intent).unwrap());
    }

    #[test]
    fn test_condition_in_and_contains() {
        let intent = json!({"user": {"roles": ["analyst", "viewer"]}, "financial": {"currency": "AUD"}});
        let in_list = Condition::Compare {
            field: "financial.currency".to_string(),
            op: CompareOp::In,
            value: json!(["AUD", "NZD"]),
        };
        assert!(in_list.evaluate(&intent).unwrap());

        let has_role = Condition::Compare {
            field: "user.roles".to_string(),
            op: CompareOp::Contains,
            value: json!("analyst"),
        };
        assert!(has_role.evaluate(&intent).unwrap());
    }

    #[test]
    fn test_scope_matching() {
        let mut config = PolicyConfig::default();
        config.scope = vec!["CREATE_PAYMENT".to_string()];
        let version = PolicyVersion {
            id: "v1".to_string(),
            policy_id: "p1".to_string(),
            version: "1.0.0".to_string(),
            hash: String::new(),
            content: PolicyContent {
                rules: Vec::new(),
                data: Value::Null,
                config,
                dependencies: Vec::new(),
                constraints: Vec::new(),
            },
            metadata: PolicyMetadata::default(),
            parent_version: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            created_by: "tester".to_string(),
            status: VersionStatus::Active,
        };
        assert!(version.in_scope("CREATE_PAYMENT"));
        assert!(!version.in_scope("VIEW_BALANCE"));
    }
}
