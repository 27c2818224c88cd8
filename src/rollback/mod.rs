// # Rollback Module
//
// Plans, validates, approves, and executes multi-policy restorations.
// A plan moves DRAFT → VALIDATED → APPROVED → EXECUTING → (COMPLETED |
// FAILED); execution refuses anything not APPROVED.

pub mod executor;
pub mod planner;

pub use executor::{PhaseResult, RollbackExecution, RollbackExecutor};
pub use planner::RollbackPlanner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the restoration target is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTargetType {
    Version,
    Timestamp,
    Snapshot,
}

/// What to restore, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTarget {
    pub target_type: RollbackTargetType,
    /// Version string, RFC-3339 timestamp, or snapshot id.
    pub value: String,
    pub policy_ids: Vec<String>,
    pub include_data: bool,
    pub preserve_audit_trail: bool,
}

/// Execution window constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: String,
}

/// Scope of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackScope {
    pub policies: Vec<String>,
    pub time_window: Option<TimeWindow>,
}

/// The four execution phases, always in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackPhase {
    BackupCurrent,
    RestoreTarget,
    ClearCache,
    ValidateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Draft,
    Validated,
    Approved,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Assessed data loss exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLossRisk {
    None,
    Minimal,
    Moderate,
    Severe,
}

/// Result of one validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub reason: String,
}

/// A rollback plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub id: String,
    pub target: RollbackTarget,
    pub scope: RollbackScope,
    pub phases: Vec<RollbackPhase>,
    pub status: PlanStatus,
    pub risk: RiskLevel,
    pub approval_required: bool,
    pub maintenance_window: Option<String>,
    pub business_justification: String,
    pub technical_justification: String,
    pub data_loss_risk: DataLossRisk,
    /// Explicit sign-off for moderate or severe data loss.
    pub data_loss_approved: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub validation: Vec<ValidationCheck>,
}

impl RollbackPlan {
    pub fn validation_passed(&self) -> bool {
        !self.validation.is_empty() && self.validation.iter().all(|check| check.passed)
    }
}
