// # Audit Ledger Module
//
// Durable, tamper-evident chronological record of every policy, key, and
// transformation event in the vault.
//
// ## Features
//
// - **Hash-Chained Integrity**: each entry carries an HMAC-SHA256 over its
//   canonical form and the previous entry's hash
// - **Differentiated Retention**: 7 / 10 / 50 year classes assigned at
//   record time from entry content
// - **Advanced Querying**: user, action, result, date-range, and retention
//   filters with pagination
// - **Read-Only Halt**: chain corruption freezes appends until repaired
// - **Compliance Summaries**: per-framework aggregates for reporting
//
// ## Entry Structure
//
// ```text
// ┌─────────────────────────────────────────────┐
// │  Audit Entry                                │
// ├─────────────────────────────────────────────┤
// │  - Timestamp (UTC, ms precision)            │
// │  - User ID / Action / Target                │
// │  - Result (Success / Failure / Partial)     │
// │  - Details (structured JSON)                │
// │  - Retention class (7 / 10 / 50 years)      │
// │  - Previous Hash (chain)                    │
// │  - Integrity Hash (keyed)                   │
// └─────────────────────────────────────────────┘
// ```

pub mod canonical;
pub mod ledger;
pub mod query;

pub use canonical::{canonical_bytes, canonical_string, truncate_to_millis, CANONICAL_VERSION};
pub use ledger::{AlertSubscriber, AuditLedger, GENESIS_HASH};
pub use query::{AuditQuery, AuditStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audited action types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    EvaluatePolicy,
    TransformData,
    CreatePolicy,
    ApprovePolicy,
    DeployPolicy,
    ArchivePolicy,
    RestorePolicy,
    DeletePolicy,
    StartAtomicTransaction,
    CompleteAtomicTransaction,
    FailAtomicTransaction,
    RollbackPlanned,
    RollbackApproved,
    RollbackCompleted,
    RollbackFailed,
    GenerateKey,
    RetrieveKey,
    RotateKey,
    RevokeKey,
    BackupKeys,
    RestoreKeys,
    ConsentGranted,
    ConsentWithdrawn,
    AccessDenied,
    #[serde(untagged)]
    Custom(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::EvaluatePolicy => "EVALUATE_POLICY",
            AuditAction::TransformData => "TRANSFORM_DATA",
            AuditAction::CreatePolicy => "CREATE_POLICY",
            AuditAction::ApprovePolicy => "APPROVE_POLICY",
            AuditAction::DeployPolicy => "DEPLOY_POLICY",
            AuditAction::ArchivePolicy => "ARCHIVE_POLICY",
            AuditAction::RestorePolicy => "RESTORE_POLICY",
            AuditAction::DeletePolicy => "DELETE_POLICY",
            AuditAction::StartAtomicTransaction => "START_ATOMIC_TRANSACTION",
            AuditAction::CompleteAtomicTransaction => "COMPLETE_ATOMIC_TRANSACTION",
            AuditAction::FailAtomicTransaction => "FAIL_ATOMIC_TRANSACTION",
            AuditAction::RollbackPlanned => "ROLLBACK_PLANNED",
            AuditAction::RollbackApproved => "ROLLBACK_APPROVED",
            AuditAction::RollbackCompleted => "ROLLBACK_COMPLETED",
            AuditAction::RollbackFailed => "ROLLBACK_FAILED",
            AuditAction::GenerateKey => "GENERATE_KEY",
            AuditAction::RetrieveKey => "RETRIEVE_KEY",
            AuditAction::RotateKey => "ROTATE_KEY",
            AuditAction::RevokeKey => "REVOKE_KEY",
            AuditAction::BackupKeys => "BACKUP_KEYS",
            AuditAction::RestoreKeys => "RESTORE_KEYS",
            AuditAction::ConsentGranted => "CONSENT_GRANTED",
            AuditAction::ConsentWithdrawn => "CONSENT_WITHDRAWN",
            AuditAction::AccessDenied => "ACCESS_DENIED",
            AuditAction::Custom(s) => s,
        }
    }
}

/// Result of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Success,
    Failure,
    Partial,
}

/// Transport metadata recorded with each entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditMeta {
    pub session_id: String,
    pub request_id: String,
    pub ip_address: String,
}

/// One append-only ledger entry. Never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    #[serde(with = "canonical::ts_millis")]
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: AuditAction,
    pub target: String,
    pub result: AuditResult,
    pub details: Value,
    pub metadata: AuditMeta,
    pub retention_years: u32,
    pub prev_hash: String,
    pub integrity_hash: String,
}

/// Compliance frameworks that raise retention to ten years.
const TEN_YEAR_FRAMEWORKS: &[&str] = &["AUSTRAC", "Privacy Act", "ISM"];

/// Keys in entry details that mark indigenous data.
const INDIGENOUS_MARKERS: &[&str] = &["culturalSensitivity", "traditionalOwners"];

/// Assign the retention class for an entry at record time.
///
/// Indigenous markers take 50 years, regulated frameworks 10, everything
/// else 7. Applied once; the class on a stored entry is never revised.
pub fn classify_retention(details: &Value, compliance_frameworks: &[String]) -> u32 {
    if contains_indigenous_markers(details) {
        return 50;
    }
    if compliance_frameworks
        .iter()
        .any(|f| TEN_YEAR_FRAMEWORKS.iter().any(|t| t.eq_ignore_ascii_case(f)))
    {
        return 10;
    }
    7
}

fn contains_indigenous_markers(details: &Value) -> bool {
    match details {
        Value::Object(map) => map.iter().any(|(key, value)| {
            key.starts_with("indigenous")
                || INDIGENOUS_MARKERS.contains(&key.as_str())
                || contains_indigenous_markers(value)
        }),
        Value::Array(items) => items.iter().any(contains_indigenous_markers),
        _ => false,
    }
}
