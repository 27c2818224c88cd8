// # Rollback Planner
//
// Builds plans, assesses their risk, and runs the validation checks. Every
// check produces a pass/fail with a reason; a plan only reaches VALIDATED
// when all of them pass.

use crate::error::{Result, VaultError};
use crate::policy::{Enforcement, PolicyVersionStore};
use crate::rollback::{
    DataLossRisk, PlanStatus, RiskLevel, RollbackPhase, RollbackPlan, RollbackScope,
    RollbackTarget, RollbackTargetType, ValidationCheck,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// The planner.
pub struct RollbackPlanner {
    store: Arc<PolicyVersionStore>,
    /// Changes inside this window before plan creation count as concurrent.
    grace_window: Duration,
}

impl RollbackPlanner {
    pub fn new(store: Arc<PolicyVersionStore>) -> Self {
        Self {
            store,
            grace_window: Duration::minutes(5),
        }
    }

    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    /// Draft a plan with the standard phase sequence and an assessed risk.
    pub fn create_plan(
        &self,
        target: RollbackTarget,
        scope: RollbackScope,
        business_justification: &str,
        technical_justification: &str,
        actor: &str,
    ) -> RollbackPlan {
        let risk = self.assess_risk(&target);
        let data_loss_risk = if target.include_data {
            DataLossRisk::Moderate
        } else {
            DataLossRisk::Minimal
        };

        RollbackPlan {
            id: Uuid::new_v4().to_string(),
            target,
            scope,
            phases: vec![
                RollbackPhase::BackupCurrent,
                RollbackPhase::RestoreTarget,
                RollbackPhase::ClearCache,
                RollbackPhase::ValidateState,
            ],
            status: PlanStatus::Draft,
            risk,
            approval_required: true,
            maintenance_window: None,
            business_justification: business_justification.to_string(),
            technical_justification: technical_justification.to_string(),
            data_loss_risk,
            data_loss_approved: false,
            created_at: Utc::now(),
            created_by: actor.to_string(),
            approved_by: None,
            validation: Vec::new(),
        }
    }

    /// Run every validation check and move the plan to VALIDATED when all
    /// pass. A failed validation leaves the plan in DRAFT with the results
    /// recorded.
    pub fn validate(&self, plan: &mut RollbackPlan) -> Result<Vec<ValidationCheck>> {
        if plan.status != PlanStatus::Draft {
            return Err(VaultError::PreconditionFailed(format!(
                "validate requires DRAFT, plan {} is {:?}",
                plan.id, plan.status
            )));
        }

        let checks = vec![
            self.check_target_exists(plan),
            self.check_concurrent_modification(plan),
            self.check_dependency_safety(plan),
            self.check_time_window(plan),
            self.check_data_loss_risk(plan),
        ];

        plan.validation = checks.clone();
        if plan.validation_passed() {
            plan.status = PlanStatus::Validated;
        }
        Ok(checks)
    }

    fn assess_risk(&self, target: &RollbackTarget) -> RiskLevel {
        let blocking_affected = target.policy_ids.iter().any(|policy_id| {
            self.store
                .get_active(policy_id)
                .map(|v| v.content.config.enforcement == Enforcement::Blocking)
                .unwrap_or(false)
        });

        match (target.policy_ids.len(), blocking_affected) {
            (0..=1, false) => RiskLevel::Low,
            (_, false) => RiskLevel::Medium,
            (0..=2, true) => RiskLevel::High,
            (_, true) => RiskLevel::Critical,
        }
    }

    fn check_target_exists(&self, plan: &RollbackPlan) -> ValidationCheck {
        let mut missing = Vec::new();
        for policy_id in &plan.target.policy_ids {
            let found = match plan.target.target_type {
                RollbackTargetType::Version => self
                    .store
                    .get_version(policy_id, &plan.target.value)
                    .is_some(),
                RollbackTargetType::Timestamp => {
                    match DateTime::parse_from_rfc3339(&plan.target.value) {
                        Ok(cutoff) => self
                            .store
                            .list_versions(policy_id)
                            .iter()
                            .any(|v| v.created_at <= cutoff.with_timezone(&Utc)),
                        Err(_) => false,
                    }
                }
                RollbackTargetType::Snapshot => self.store.exists(policy_id),
            };
            if !found {
                missing.push(policy_id.clone());
            }
        }

        if missing.is_empty() {
            ValidationCheck {
                name: "target_exists".to_string(),
                passed: true,
                reason: "target resolves for every affected policy".to_string(),
            }
        } else {
            ValidationCheck {
                name: "target_exists".to_string(),
                passed: false,
                reason: format!(
                    "target {} not found for: {}",
                    plan.target.value,
                    missing.join(", ")
                ),
            }
        }
    }

    fn check_concurrent_modification(&self, plan: &RollbackPlan) -> ValidationCheck {
        let since = plan.created_at - self.grace_window;
        let changes = self.store.changes_since(&plan.scope.policies, since);
        if changes.is_empty() {
            ValidationCheck {
                name: "concurrent_modification".to_string(),
                passed: true,
                reason: "no concurrent changes in the grace window".to_string(),
            }
        } else {
            ValidationCheck {
                name: "concurrent_modification".to_string(),
                passed: false,
                reason: format!(
                    "{} change(s) to scoped policies since {}",
                    changes.len(),
                    since.to_rfc3339()
                ),
            }
        }
    }

    fn check_dependency_safety(&self, plan: &RollbackPlan) -> ValidationCheck {
        let mut conflicts = Vec::new();
        for active in self.store.list_active() {
            if plan.scope.policies.contains(&active.policy_id) {
                continue;
            }
            for dependency in &active.content.dependencies {
                if plan.scope.policies.contains(dependency) {
                    conflicts.push(format!("{} depends on {}", active.policy_id, dependency));
                }
            }
        }

        if conflicts.is_empty() {
            ValidationCheck {
                name: "dependency_safety".to_string(),
                passed: true,
                reason: "no active policy depends on a rolled-back version".to_string(),
            }
        } else {
            ValidationCheck {
                name: "dependency_safety".to_string(),
                passed: false,
                reason: conflicts.join("; "),
            }
        }
    }

    fn check_time_window(&self, plan: &RollbackPlan) -> ValidationCheck {
        match &plan.scope.time_window {
            None => ValidationCheck {
                name: "time_window".to_string(),
                passed: true,
                reason: "no execution window constraint".to_string(),
            },
            Some(window) => {
                let now = Utc::now();
                if now >= window.start && now <= window.end {
                    ValidationCheck {
                        name: "time_window".to_string(),
                        passed: true,
                        reason: format!("within window ({})", window.timezone),
                    }
                } else {
                    ValidationCheck {
                        name: "time_window".to_string(),
                        passed: false,
                        reason: format!(
                            "outside window {} - {} ({})",
                            window.start.to_rfc3339(),
                            window.end.to_rfc3339(),
                            window.timezone
                        ),
                    }
                }
            }
        }
    }

    fn check_data_loss_risk(&self, plan: &RollbackPlan) -> ValidationCheck {
        if plan.data_loss_risk <= DataLossRisk::Minimal || plan.data_loss_approved {
            ValidationCheck {
                name: "data_loss_risk".to_string(),
                passed: true,
                reason: format!("risk {:?} acceptable", plan.data_loss_risk),
            }
        } else {
            ValidationCheck {
                name: "data_loss_risk".to_string(),
                passed: false,
                reason: format!(
                    "risk {:?} requires explicit approval",
                    plan.data_loss_risk
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{
        Condition, PolicyContent, PolicyMetadata, PolicyRule, PolicyRuleKind,
    };

    fn content(dependencies: Vec<&str>) -> PolicyContent {
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
            dependencies: dependencies.into_iter().map(str::to_string).collect(),
            constraints: Vec::new(),
        }
    }

    fn seeded_store() -> Arc<PolicyVersionStore> {
        let store = Arc::new(PolicyVersionStore::new());
        store
            .create_version("p1", content(vec![]), PolicyMetadata::default(), "author")
            .unwrap();
        store.approve("p1", "1.0.0", "reviewer").unwrap();
        store.deploy("p1", "1.0.0", "ops").unwrap();
        store
    }

    fn version_target(policy_ids: Vec<&str>, value: &str) -> RollbackTarget {
        RollbackTarget {
            target_type: RollbackTargetType::Version,
            value: value.to_string(),
            policy_ids: policy_ids.into_iter().map(str::to_string).collect(),
            include_data: false,
            preserve_audit_trail: true,
        }
    }

    fn scope(policies: Vec<&str>) -> RollbackScope {
        RollbackScope {
            policies: policies.into_iter().map(str::to_string).collect(),
            time_window: None,
        }
    }

    #[test]
    fn test_valid_plan_reaches_validated() {
        let store = seeded_store();
        let planner = RollbackPlanner::new(store).with_grace_window(Duration::zero());

        let mut plan = planner.create_plan(
            version_target(vec!["p1"], "1.0.0"),
            scope(vec!["p1"]),
            "revert bad limit",
            "restore 1.0.0",
            "ops",
        );
        let checks = planner.validate(&mut plan).unwrap();
        assert_eq!(checks.len(), 5);
        assert!(plan.validation_passed());
        assert_eq!(plan.status, PlanStatus::Validated);
    }

    #[test]
    fn test_missing_target_fails_validation() {
        let store = seeded_store();
        let planner = RollbackPlanner::new(store).with_grace_window(Duration::zero());

        let mut plan = planner.create_plan(
            version_target(vec!["p1"], "9.9.9"),
            scope(vec!["p1"]),
            "bad",
            "bad",
            "ops",
        );
        planner.validate(&mut plan).unwrap();
        assert!(!plan.validation_passed());
        assert_eq!(plan.status, PlanStatus::Draft);
        let failed: Vec<_> = plan.validation.iter().filter(|c| !c.passed).collect();
        assert_eq!(failed[0].name, "target_exists");
    }

    #[test]
    fn test_concurrent_modification_detected() {
        let store = seeded_store();
        let planner = RollbackPlanner::new(store.clone()).with_grace_window(Duration::zero());

        let mut plan = planner.create_plan(
            version_target(vec!["p1"], "1.0.0"),
            scope(vec!["p1"]),
            "revert",
            "revert",
            "ops",
        );

        // A change lands after the plan is drafted
        let metadata = PolicyMetadata {
            change_type: Some(crate::policy::ChangeType::Update),
            ..Default::default()
        };
        store
            .create_version("p1", content(vec![]), metadata, "author")
            .unwrap();

        planner.validate(&mut plan).unwrap();
        let check = plan
            .validation
            .iter()
            .find(|c| c.name == "concurrent_modification")
            .unwrap();
        assert!(!check.passed);
    }

    #[test]
    fn test_dependency_safety_conflict() {
        let store = seeded_store();
        // An active policy outside scope depends on p1
        store
            .create_version("consumer", content(vec!["p1"]), PolicyMetadata::default(), "author")
            .unwrap();
        store.approve("consumer", "1.0.0", "reviewer").unwrap();
        store.deploy("consumer", "1.0.0", "ops").unwrap();

        let planner = RollbackPlanner::new(store).with_grace_window(Duration::zero());
        let mut plan = planner.create_plan(
            version_target(vec!["p1"], "1.0.0"),
            scope(vec!["p1"]),
            "revert",
            "revert",
            "ops",
        );
        planner.validate(&mut plan).unwrap();
        let check = plan
            .validation
            .iter()
            .find(|c| c.name == "dependency_safety")
            .unwrap();
        assert!(!check.passed);
        assert!(check.reason.contains("consumer"));
    }

    #[test]
    fn test_time_window_enforced() {
        let store = seeded_store();
        let planner = RollbackPlanner::new(store).with_grace_window(Duration::zero());

        let mut scope = scope(vec!["p1"]);
        scope.time_window = Some(crate::rollback::TimeWindow {
            start: Utc::now() + Duration::hours(1),
            end: Utc::now() + Duration::hours(2),
            timezone: "Australia/Melbourne".to_string(),
        });
        let mut plan = planner.create_plan(
            version_target(vec!["p1"], "1.0.0"),
            scope,
            "revert",
            "revert",
            "ops",
        );
        planner.validate(&mut plan).unwrap();
        let check = plan
            .validation
            .iter()
            .find(|c| c.name == "time_window")
            .unwrap();
        assert!(!check.passed);
    }

    #[test]
    fn test_data_loss_requires_approval() {
        let store = seeded_store();
        let planner = RollbackPlanner::new(store).with_grace_window(Duration::zero());

        let mut target = version_target(vec!["p1"], "1.0.0");
        target.include_data = true;
        let mut plan = planner.create_plan(target, scope(vec!["p1"]), "revert", "revert", "ops");
        planner.validate(&mut plan).unwrap();
        assert!(!plan.validation_passed());

        plan.status = PlanStatus::Draft;
        plan.data_loss_approved = true;
        planner.validate(&mut plan).unwrap();
        assert!(plan.validation_passed());
    }

    #[test]
    fn test_risk_assessment() {
        let store = seeded_store();
        let planner = RollbackPlanner::new(store).with_grace_window(Duration::zero());
        // p1 is active with blocking enforcement
        let plan = planner.create_plan(
            version_target(vec!["p1"], "1.0.0"),
            scope(vec!["p1"]),
            "revert",
            "revert",
            "ops",
        );
        assert_eq!(plan.risk, RiskLevel::High);
    }
}
