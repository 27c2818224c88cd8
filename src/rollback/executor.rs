// # Rollback Executor
//
// Runs approved plans through the four phases in order. Any phase failure
// moves the plan to FAILED and audits ROLLBACK_FAILED; success audits
// ROLLBACK_COMPLETED. The cache-clearing phase invalidates the decision
// point so no stale decision survives the restoration.

use crate::audit::{AuditAction, AuditLedger, AuditMeta, AuditResult};
use crate::error::{Result, VaultError};
use crate::policy::{PolicyDecisionPoint, PolicyVersionStore};
use crate::rollback::{PlanStatus, RollbackPhase, RollbackPlan, RollbackTargetType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of one executed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: RollbackPhase,
    pub success: bool,
    pub detail: String,
}

/// Execution report for a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackExecution {
    pub plan_id: String,
    pub phases: Vec<PhaseResult>,
    /// Active version per policy before restoration.
    pub backups: Vec<(String, Option<String>)>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The executor.
pub struct RollbackExecutor {
    store: Arc<PolicyVersionStore>,
    audit: Arc<AuditLedger>,
    decision_point: Option<Arc<PolicyDecisionPoint>>,
}

impl RollbackExecutor {
    pub fn new(store: Arc<PolicyVersionStore>, audit: Arc<AuditLedger>) -> Self {
        Self {
            store,
            audit,
            decision_point: None,
        }
    }

    pub fn with_decision_point(mut self, decision_point: Arc<PolicyDecisionPoint>) -> Self {
        self.decision_point = Some(decision_point);
        self
    }

    /// Approve a validated plan.
    pub fn approve(&self, plan: &mut RollbackPlan, approver: &str) -> Result<()> {
        if plan.status != PlanStatus::Validated {
            return Err(VaultError::PreconditionFailed(format!(
                "approve requires VALIDATED, plan {} is {:?}",
                plan.id, plan.status
            )));
        }
        plan.status = PlanStatus::Approved;
        plan.approved_by = Some(approver.to_string());

        let _ = self.audit.record(
            approver,
            AuditAction::RollbackApproved,
            &plan.id,
            serde_json::json!({ "policies": plan.scope.policies }),
            AuditResult::Success,
            AuditMeta::default(),
        );
        Ok(())
    }

    /// Execute an approved plan.
    pub fn execute(&self, plan: &mut RollbackPlan, actor: &str) -> Result<RollbackExecution> {
        if plan.status != PlanStatus::Approved {
            return Err(VaultError::NotApproved(format!(
                "plan {} is {:?}, execution requires APPROVED",
                plan.id, plan.status
            )));
        }

        plan.status = PlanStatus::Executing;
        if plan.target.preserve_audit_trail {
            self.audit.take_preservation_hold();
        }

        let mut execution = RollbackExecution {
            plan_id: plan.id.clone(),
            phases: Vec::new(),
            backups: Vec::new(),
            completed_at: None,
        };

        let phases = plan.phases.clone();
        for phase in phases {
            match self.run_phase(phase, plan, actor, &mut execution) {
                Ok(detail) => execution.phases.push(PhaseResult {
                    phase,
                    success: true,
                    detail,
                }),
                Err(error) => {
                    execution.phases.push(PhaseResult {
                        phase,
                        success: false,
                        detail: error.to_string(),
                    });
                    plan.status = PlanStatus::Failed;
                    if plan.target.preserve_audit_trail {
                        self.audit.release_preservation_hold();
                    }
                    let _ = self.audit.record(
                        actor,
                        AuditAction::RollbackFailed,
                        &plan.id,
                        serde_json::json!({
                            "phase": phase,
                            "error": error.to_string(),
                        }),
                        AuditResult::Failure,
                        AuditMeta::default(),
                    );
                    tracing::error!(plan = %plan.id, ?phase, error = %error, "rollback failed");
                    return Err(error);
                }
            }
        }

        plan.status = PlanStatus::Completed;
        execution.completed_at = Some(Utc::now());
        if plan.target.preserve_audit_trail {
            self.audit.release_preservation_hold();
        }

        let _ = self.audit.record(
            actor,
            AuditAction::RollbackCompleted,
            &plan.id,
            serde_json::json!({
                "policies": plan.scope.policies,
                "target": plan.target.value,
            }),
            AuditResult::Success,
            AuditMeta::default(),
        );
        tracing::info!(plan = %plan.id, "rollback completed");
        Ok(execution)
    }

    fn run_phase(
        &self,
        phase: RollbackPhase,
        plan: &RollbackPlan,
        actor: &str,
        execution: &mut RollbackExecution,
    ) -> Result<String> {
        match phase {
            RollbackPhase::BackupCurrent => {
                for policy_id in &plan.scope.policies {
                    let active = self.store.get_active(policy_id).map(|v| v.version);
                    execution.backups.push((policy_id.clone(), active));
                }
                Ok(format!("backed up {} policies", execution.backups.len()))
            }
            RollbackPhase::RestoreTarget => {
                for policy_id in &plan.target.policy_ids {
                    let target_version = self.resolve_target_version(plan, policy_id)?;
                    self.store.restore(policy_id, &target_version, actor)?;
                }
                Ok(format!(
                    "restored {} policies to {}",
                    plan.target.policy_ids.len(),
                    plan.target.value
                ))
            }
            RollbackPhase::ClearCache => {
                if let Some(ref decision_point) = self.decision_point {
                    decision_point.invalidate_cache();
                }
                self.store.bump_activation_generation();
                Ok("decision cache invalidated".to_string())
            }
            RollbackPhase::ValidateState => {
                for policy_id in &plan.target.policy_ids {
                    let active = self.store.get_active(policy_id).ok_or_else(|| {
                        VaultError::Integrity(format!(
                            "policy {} has no active version after restore",
                            policy_id
                        ))
                    })?;
                    let target_version = self.resolve_target_version(plan, policy_id)?;
                    let target = self
                        .store
                        .get_version(policy_id, &target_version)
                        .ok_or_else(|| {
                            VaultError::Integrity(format!(
                                "target version {} vanished for policy {}",
                                target_version, policy_id
                            ))
                        })?;
                    if active.hash != target.hash {
                        return Err(VaultError::Integrity(format!(
                            "policy {} active content differs from target {}",
                            policy_id, target_version
                        )));
                    }
                }
                Ok("restored state verified".to_string())
            }
        }
    }

    fn resolve_target_version(&self, plan: &RollbackPlan, policy_id: &str) -> Result<String> {
        match plan.target.target_type {
            RollbackTargetType::Version => Ok(plan.target.value.clone()),
            RollbackTargetType::Timestamp => {
                let cutoff = DateTime::parse_from_rfc3339(&plan.target.value)
                    .map_err(|e| {
                        VaultError::InvalidInput(format!("timestamp target invalid: {}", e))
                    })?
                    .with_timezone(&Utc);
                let mut candidates: Vec<_> = self
                    .store
                    .list_versions(policy_id)
                    .into_iter()
                    .filter(|v| v.created_at <= cutoff && !v.tags.contains(&"rollback".to_string()))
                    .collect();
                candidates.sort_by_key(|v| v.created_at);
                candidates
                    .pop()
                    .map(|v| v.version)
                    .ok_or_else(|| {
                        VaultError::NotFound(format!(
                            "policy {} has no version at {}",
                            policy_id, plan.target.value
                        ))
                    })
            }
            RollbackTargetType::Snapshot => Err(VaultError::InvalidInput(
                "snapshot targets resolve through the version store snapshot registry"
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{
        ChangeType, Condition, PolicyContent, PolicyMetadata, PolicyRule, PolicyRuleKind,
    };
    use crate::rollback::{RollbackPlanner, RollbackScope, RollbackTarget};
    use chrono::Duration;

    fn content() -> PolicyContent {
        PolicyContent {
            rules: vec![PolicyRule {
                id: "r1".to_string(),
                kind: PolicyRuleKind::Allow,
                condition: Condition::Always,
                reason: "allow".to_string(),
                conditions: Vec::new(),
                obligations: Vec::new(),
            }],
            data: serde_json::Value::Null,
            config: Default::default(),
            dependencies: Vec::new(),
            constraints: Vec::new(),
        }
    }

    fn store_with_two_versions() -> Arc<PolicyVersionStore> {
        let store = Arc::new(PolicyVersionStore::new());
        store
            .create_version("p1", content(), PolicyMetadata::default(), "author")
            .unwrap();
        store.approve("p1", "1.0.0", "reviewer").unwrap();
        store.deploy("p1", "1.0.0", "ops").unwrap();

        let metadata = PolicyMetadata {
            change_type: Some(ChangeType::Update),
            ..Default::default()
        };
        store
            .create_version("p1", content(), metadata, "author")
            .unwrap();
        store.approve("p1", "1.1.0", "reviewer").unwrap();
        store.deploy("p1", "1.1.0", "ops").unwrap();
        store
    }

    fn ready_plan(
        store: &Arc<PolicyVersionStore>,
        executor: &RollbackExecutor,
    ) -> RollbackPlan {
        let planner =
            RollbackPlanner::new(store.clone()).with_grace_window(Duration::zero());
        let mut plan = planner.create_plan(
            RollbackTarget {
                target_type: crate::rollback::RollbackTargetType::Version,
                value: "1.0.0".to_string(),
                policy_ids: vec!["p1".to_string()],
                include_data: false,
                preserve_audit_trail: true,
            },
            RollbackScope {
                policies: vec!["p1".to_string()],
                time_window: None,
            },
            "revert limit change",
            "restore 1.0.0 content",
            "ops",
        );
        planner.validate(&mut plan).unwrap();
        executor.approve(&mut plan, "approver").unwrap();
        plan
    }

    fn executor_for(store: &Arc<PolicyVersionStore>) -> (Arc<AuditLedger>, RollbackExecutor) {
        let audit = Arc::new(AuditLedger::new(b"test-integrity-key-32-bytes-long".to_vec()));
        let executor = RollbackExecutor::new(store.clone(), audit.clone());
        (audit, executor)
    }

    #[test]
    fn test_execute_requires_approval() {
        let store = store_with_two_versions();
        let (_audit, executor) = executor_for(&store);
        let planner =
            RollbackPlanner::new(store.clone()).with_grace_window(Duration::zero());
        let mut plan = planner.create_plan(
            RollbackTarget {
                target_type: crate::rollback::RollbackTargetType::Version,
                value: "1.0.0".to_string(),
                policy_ids: vec!["p1".to_string()],
                include_data: false,
                preserve_audit_trail: true,
            },
            RollbackScope {
                policies: vec!["p1".to_string()],
                time_window: None,
            },
            "revert",
            "revert",
            "ops",
        );
        planner.validate(&mut plan).unwrap();

        let err = executor.execute(&mut plan, "ops").unwrap_err();
        assert!(matches!(err, VaultError::NotApproved(_)));
    }

    #[test]
    fn test_successful_execution_restores_content() {
        let store = store_with_two_versions();
        let (audit, executor) = executor_for(&store);
        let mut plan = ready_plan(&store, &executor);

        let execution = executor.execute(&mut plan, "ops").unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(execution.phases.len(), 4);
        assert!(execution.phases.iter().all(|p| p.success));
        assert_eq!(
            execution.backups,
            vec![("p1".to_string(), Some("1.1.0".to_string()))]
        );

        // Active content now equals the 1.0.0 target
        let active = store.get_active("p1").unwrap();
        let target = store.get_version("p1", "1.0.0").unwrap();
        assert_eq!(active.hash, target.hash);

        let completed = audit.query(
            &crate::audit::AuditQuery::new().action(AuditAction::RollbackCompleted),
        );
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn test_failed_phase_fails_plan() {
        let store = store_with_two_versions();
        let (audit, executor) = executor_for(&store);
        let mut plan = ready_plan(&store, &executor);
        // Point the restore phase at a version that does not exist
        plan.target.value = "9.9.9".to_string();

        let err = executor.execute(&mut plan, "ops").unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
        assert_eq!(plan.status, PlanStatus::Failed);

        let failed = audit.query(
            &crate::audit::AuditQuery::new().action(AuditAction::RollbackFailed),
        );
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn test_preservation_hold_released_after_completion() {
        let store = store_with_two_versions();
        let (audit, executor) = executor_for(&store);
        let mut plan = ready_plan(&store, &executor);

        executor.execute(&mut plan, "ops").unwrap();

        // Hold released: purge with a far-future clock removes entries
        let far_future = Utc::now() + Duration::days(365 * 100);
        assert!(audit.purge_expired(far_future) > 0);
    }

    #[test]
    fn test_timestamp_target_resolution() {
        let store = store_with_two_versions();
        let (_audit, executor) = executor_for(&store);
        let planner =
            RollbackPlanner::new(store.clone()).with_grace_window(Duration::zero());

        let cutoff = Utc::now().to_rfc3339();
        let mut plan = planner.create_plan(
            RollbackTarget {
                target_type: crate::rollback::RollbackTargetType::Timestamp,
                value: cutoff,
                policy_ids: vec!["p1".to_string()],
                include_data: false,
                preserve_audit_trail: false,
            },
            RollbackScope {
                policies: vec!["p1".to_string()],
                time_window: None,
            },
            "revert to now",
            "latest version before cutoff",
            "ops",
        );
        planner.validate(&mut plan).unwrap();
        executor.approve(&mut plan, "approver").unwrap();
        let execution = executor.execute(&mut plan, "ops").unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert!(execution.completed_at.is_some());
    }
}
