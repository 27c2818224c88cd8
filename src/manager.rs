// # Vault Manager
//
// Composition root wiring the consent registry, key manager, audit ledger,
// transformation engine, policy store, decision point, atomic executor, and
// rollback engine together. All components are injected here; nothing in the
// crate is process-global.
//
// Two surfaces hang off the manager: the runtime surface (evaluate,
// transform) on the hot path, and the administrative surface where every
// operation is role-checked and audited. Administrative mutations are
// refused while the audit ledger is halted.

use crate::admin::{authorize, AdminContext, AdminOperation};
use crate::audit::{
    AuditAction, AuditEntry, AuditLedger, AuditMeta, AuditQuery, AuditResult, AuditStats,
};
use crate::consent::{ConsentLevel, ConsentMethod, ConsentRegistry};
use crate::error::{Result, VaultError};
use crate::intent::{Decision, Intent};
use crate::keys::{
    EncryptionKey, KeyManager, KeyManagerConfig, KeyPurpose, MaintenanceReport,
};
use crate::policy::{
    diff::diff_versions, AtomicPolicyExecutor, AtomicTransaction, PolicyContent,
    PolicyDecisionPoint, PolicyMetadata, PolicyOperation, PolicyVersion, PolicyVersionStore,
    VersionDiff,
};
use crate::rollback::{
    RollbackExecution, RollbackExecutor, RollbackPlan, RollbackPlanner, RollbackScope,
    RollbackTarget, ValidationCheck,
};
use crate::transform::{FieldMeta, RuleTable, TransformContext, TransformEngine, TransformOutcome};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Vault configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    pub decision_cache_ttl: Duration,
    pub lock_timeout: Duration,
    pub transaction_timeout: Duration,
    /// Changes inside this window before a rollback plan's creation count
    /// as concurrent modifications.
    pub rollback_grace_window: Duration,
}

impl VaultConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            decision_cache_ttl: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
            rollback_grace_window: Duration::from_secs(300),
        }
    }
}

/// The vault.
pub struct VaultManager {
    config: VaultConfig,
    consent: Arc<ConsentRegistry>,
    keys: Arc<KeyManager>,
    audit: Arc<AuditLedger>,
    store: Arc<PolicyVersionStore>,
    decision_point: Arc<PolicyDecisionPoint>,
    atomic: AtomicPolicyExecutor,
    planner: RollbackPlanner,
    rollback: RollbackExecutor,
    transform: TransformEngine,
}

impl VaultManager {
    /// Build the vault. The master key seals every managed key at rest; the
    /// audit integrity key is created on first start and reused afterwards.
    pub fn new(config: VaultConfig, master_key: Vec<u8>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| VaultError::Storage(format!("create vault directory: {}", e)))?;

        let consent = Arc::new(ConsentRegistry::new());
        let keys = Arc::new(
            KeyManager::new(KeyManagerConfig::new(&config.data_dir), master_key)?
                .with_consent(consent.clone()),
        );

        let integrity_key = match keys
            .list(Some(KeyPurpose::AuditIntegrity))
            .into_iter()
            .next()
        {
            Some(existing) => keys.get(&existing.id)?.material,
            None => keys.generate(KeyPurpose::AuditIntegrity, "internal", None)?.material,
        };

        let audit = Arc::new(AuditLedger::with_log_file(
            integrity_key,
            config.data_dir.join("audit").join("audit.log"),
        )?);
        keys.set_audit(audit.clone());

        let store = Arc::new(PolicyVersionStore::new().with_lock_timeout(config.lock_timeout));
        store.set_audit(audit.clone());

        let decision_point = Arc::new(
            PolicyDecisionPoint::new(store.clone(), audit.clone())
                .with_cache_ttl(config.decision_cache_ttl),
        );
        let atomic = AtomicPolicyExecutor::new(store.clone(), audit.clone())
            .with_timeouts(config.lock_timeout, config.transaction_timeout);
        let grace_window = chrono::Duration::from_std(config.rollback_grace_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let planner = RollbackPlanner::new(store.clone()).with_grace_window(grace_window);
        let rollback = RollbackExecutor::new(store.clone(), audit.clone())
            .with_decision_point(decision_point.clone());
        let transform = TransformEngine::new(HashMap::new(), RuleTable::empty());

        Ok(Self {
            config,
            consent,
            keys,
            audit,
            store,
            decision_point,
            atomic,
            planner,
            rollback,
            transform,
        })
    }

    /// Install field classifications and an explicit rule table for the
    /// transformation engine. A tokenization key is provisioned on demand.
    pub fn with_transform(
        mut self,
        classifications: HashMap<String, FieldMeta>,
        rules: RuleTable,
    ) -> Result<Self> {
        let token_key = match self
            .keys
            .list(Some(KeyPurpose::Tokenization))
            .into_iter()
            .next()
        {
            Some(existing) => existing.id,
            None => {
                self.keys
                    .generate(KeyPurpose::Tokenization, "confidential", None)?
                    .id
            }
        };
        self.transform = TransformEngine::new(classifications, rules)
            .with_key_manager(self.keys.clone(), token_key);
        Ok(self)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn consent(&self) -> &Arc<ConsentRegistry> {
        &self.consent
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn audit(&self) -> &Arc<AuditLedger> {
        &self.audit
    }

    pub fn store(&self) -> &Arc<PolicyVersionStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Runtime surface
    // ------------------------------------------------------------------

    /// Evaluate an intent. Fail-closed; always returns a decision and
    /// writes exactly one audit entry.
    pub fn evaluate(&self, intent: &Intent, policy_names: &[String]) -> Decision {
        self.decision_point.evaluate(intent, policy_names)
    }

    /// Evaluate an intent for an automated purpose. Requires an active
    /// full-automation consent for (user, purpose) before evaluation runs.
    pub fn evaluate_automated(
        &self,
        intent: &Intent,
        purpose: &str,
        policy_names: &[String],
    ) -> Result<Decision> {
        self.consent
            .require(&intent.user.id, purpose, ConsentLevel::FullAutomation)?;
        Ok(self.decision_point.evaluate(intent, policy_names))
    }

    /// Transform a payload under a caller context.
    pub fn transform(
        &self,
        payload: &Value,
        context: &TransformContext,
    ) -> Result<TransformOutcome> {
        self.transform.transform(payload, context)
    }

    /// Grant consent and audit the grant.
    pub fn grant_consent(
        &self,
        user_id: &str,
        purpose: &str,
        level: ConsentLevel,
        method: ConsentMethod,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let record = self.consent.grant(user_id, purpose, level, method, expires_at);
        self.audit.record(
            user_id,
            AuditAction::ConsentGranted,
            purpose,
            serde_json::json!({ "level": record.level, "method": record.method }),
            AuditResult::Success,
            AuditMeta::default(),
        )?;
        Ok(())
    }

    /// Withdraw consent and audit the withdrawal.
    pub fn withdraw_consent(&self, user_id: &str, purpose: &str) -> Result<()> {
        self.consent.withdraw(user_id, purpose)?;
        self.audit.record(
            user_id,
            AuditAction::ConsentWithdrawn,
            purpose,
            serde_json::json!({}),
            AuditResult::Success,
            AuditMeta::default(),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administrative surface: policy lifecycle
    // ------------------------------------------------------------------

    pub fn create_policy_version(
        &self,
        context: &AdminContext,
        policy_id: &str,
        content: PolicyContent,
        metadata: PolicyMetadata,
    ) -> Result<PolicyVersion> {
        self.guard_mutation(context, AdminOperation::CreatePolicyVersion)?;
        self.store
            .create_version(policy_id, content, metadata, &context.actor_id)
    }

    pub fn approve_policy(
        &self,
        context: &AdminContext,
        policy_id: &str,
        version: &str,
    ) -> Result<PolicyVersion> {
        self.guard_mutation(context, AdminOperation::ApprovePolicy)?;
        self.store.approve(policy_id, version, &context.actor_id)
    }

    pub fn deploy_policy(
        &self,
        context: &AdminContext,
        policy_id: &str,
        version: &str,
    ) -> Result<PolicyVersion> {
        self.guard_mutation(context, AdminOperation::DeployPolicy)?;
        self.store.deploy(policy_id, version, &context.actor_id)
    }

    pub fn archive_policy(
        &self,
        context: &AdminContext,
        policy_id: &str,
        version: &str,
    ) -> Result<PolicyVersion> {
        self.guard_mutation(context, AdminOperation::ArchivePolicy)?;
        self.store.archive(policy_id, version, &context.actor_id)
    }

    pub fn restore_policy(
        &self,
        context: &AdminContext,
        policy_id: &str,
        target_version: &str,
    ) -> Result<PolicyVersion> {
        self.guard_mutation(context, AdminOperation::RestorePolicy)?;
        self.store
            .restore(policy_id, target_version, &context.actor_id)
    }

    pub fn diff_policy(
        &self,
        policy_id: &str,
        from_version: &str,
        to_version: &str,
    ) -> Result<VersionDiff> {
        diff_versions(&self.store, policy_id, from_version, to_version)
    }

    pub fn execute_atomic_set(
        &self,
        context: &AdminContext,
        operations: Vec<PolicyOperation>,
        dry_run: bool,
    ) -> Result<AtomicTransaction> {
        self.guard_mutation(context, AdminOperation::ExecuteAtomicSet)?;
        self.atomic.execute(operations, &context.actor_id, dry_run)
    }

    // ------------------------------------------------------------------
    // Administrative surface: rollback
    // ------------------------------------------------------------------

    pub fn create_rollback_plan(
        &self,
        context: &AdminContext,
        target: RollbackTarget,
        scope: RollbackScope,
        business_justification: &str,
        technical_justification: &str,
    ) -> Result<RollbackPlan> {
        self.guard_mutation(context, AdminOperation::CreateRollbackPlan)?;
        let plan = self.planner.create_plan(
            target,
            scope,
            business_justification,
            technical_justification,
            &context.actor_id,
        );
        self.audit.record(
            &context.actor_id,
            AuditAction::RollbackPlanned,
            &plan.id,
            serde_json::json!({ "policies": plan.scope.policies, "risk": plan.risk }),
            AuditResult::Success,
            self.meta_from(context),
        )?;
        Ok(plan)
    }

    pub fn validate_rollback_plan(
        &self,
        context: &AdminContext,
        plan: &mut RollbackPlan,
    ) -> Result<Vec<ValidationCheck>> {
        self.guard(context, AdminOperation::ValidateRollbackPlan)?;
        self.planner.validate(plan)
    }

    pub fn approve_rollback_plan(
        &self,
        context: &AdminContext,
        plan: &mut RollbackPlan,
    ) -> Result<()> {
        self.guard_mutation(context, AdminOperation::ApproveRollbackPlan)?;
        self.rollback.approve(plan, &context.actor_id)
    }

    pub fn execute_rollback_plan(
        &self,
        context: &AdminContext,
        plan: &mut RollbackPlan,
    ) -> Result<RollbackExecution> {
        self.guard_mutation(context, AdminOperation::ExecuteRollback)?;
        self.rollback.execute(plan, &context.actor_id)
    }

    // ------------------------------------------------------------------
    // Administrative surface: keys
    // ------------------------------------------------------------------

    pub fn list_keys(&self, context: &AdminContext) -> Result<Vec<EncryptionKey>> {
        self.guard(context, AdminOperation::ListKeys)?;
        Ok(self.keys.list(None))
    }

    pub fn rotate_key(&self, context: &AdminContext, key_id: &str) -> Result<EncryptionKey> {
        self.guard_mutation(context, AdminOperation::RotateKey)?;
        self.keys.rotate(key_id)
    }

    pub fn revoke_key(&self, context: &AdminContext, key_id: &str, reason: &str) -> Result<()> {
        self.guard_mutation(context, AdminOperation::RevokeKey)?;
        self.keys.revoke(key_id, reason)
    }

    pub fn backup_keys(&self, context: &AdminContext) -> Result<Vec<u8>> {
        self.guard_mutation(context, AdminOperation::BackupKeys)?;
        self.keys.backup()
    }

    pub fn restore_keys(&self, context: &AdminContext, bundle: &[u8]) -> Result<usize> {
        self.guard_mutation(context, AdminOperation::RestoreKeys)?;
        self.keys.restore(bundle)
    }

    pub fn key_maintenance(&self, context: &AdminContext) -> Result<MaintenanceReport> {
        self.guard_mutation(context, AdminOperation::RotateKey)?;
        self.keys.maintenance()
    }

    // ------------------------------------------------------------------
    // Administrative surface: audit
    // ------------------------------------------------------------------

    pub fn query_audit(&self, context: &AdminContext, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.guard(context, AdminOperation::QueryAudit)?;
        Ok(self.audit.query(query))
    }

    pub fn verify_audit_entry(&self, context: &AdminContext, entry_id: &str) -> Result<bool> {
        self.guard(context, AdminOperation::VerifyAudit)?;
        self.audit.verify(entry_id)
    }

    pub fn verify_audit_chain(&self, context: &AdminContext, entry_id: &str) -> Result<bool> {
        self.guard(context, AdminOperation::VerifyAudit)?;
        self.audit.verify_chain(entry_id)
    }

    pub fn audit_stats(
        &self,
        context: &AdminContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditStats> {
        self.guard(context, AdminOperation::QueryAudit)?;
        Ok(self.audit.stats(from, to))
    }

    // ------------------------------------------------------------------

    /// Role check for read-only administrative operations. Denials are
    /// audited with the role that was missing.
    fn guard(&self, context: &AdminContext, operation: AdminOperation) -> Result<()> {
        match authorize(context, operation) {
            Ok(()) => Ok(()),
            Err(error) => {
                let required = match &error {
                    VaultError::Forbidden { required_role, .. } => required_role.clone(),
                    _ => None,
                };
                let _ = self.audit.record(
                    &context.actor_id,
                    AuditAction::AccessDenied,
                    operation.as_str(),
                    serde_json::json!({ "requiredRole": required }),
                    AuditResult::Failure,
                    self.meta_from(context),
                );
                Err(error)
            }
        }
    }

    /// Role check plus the read-only gate taken by mutating operations
    /// while the audit chain is halted.
    fn guard_mutation(&self, context: &AdminContext, operation: AdminOperation) -> Result<()> {
        if self.audit.is_halted() {
            return Err(VaultError::Storage(
                "vault is read-only until the audit chain is repaired".to_string(),
            ));
        }
        self.guard(context, operation)
    }

    fn meta_from(&self, context: &AdminContext) -> AuditMeta {
        AuditMeta {
            session_id: context.session_id.clone(),
            request_id: context.request_id.clone(),
            ip_address: context.ip_address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{
        CompareOp, Condition, Enforcement, PolicyConfig, PolicyRule, PolicyRuleKind,
    };
    use crate::intent::{ComplianceMeta, FinancialDetails, Operation, RequestMeta, UserContext};

    fn vault() -> (tempfile::TempDir, VaultManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = VaultManager::new(VaultConfig::new(dir.path()), vec![3u8; 32]).unwrap();
        (dir, manager)
    }

    fn admin(roles: &[&str]) -> AdminContext {
        AdminContext::new("admin-1", roles.iter().map(|r| r.to_string()).collect())
    }

    fn spend_limit_content(limit: u64) -> PolicyContent {
        PolicyContent {
            rules: vec![PolicyRule {
                id: "limit".to_string(),
                kind: PolicyRuleKind::Allow,
                condition: Condition::Compare {
                    field: "financial.amount".to_string(),
                    op: CompareOp::Lt,
                    value: serde_json::json!(limit),
                },
                reason: "amount exceeds spend limit".to_string(),
                conditions: Vec::new(),
                obligations: Vec::new(),
            }],
            data: Value::Null,
            config: PolicyConfig {
                enforcement: Enforcement::Blocking,
                ..Default::default()
            },
            dependencies: Vec::new(),
            constraints: Vec::new(),
        }
    }

    fn payment_intent(amount: f64) -> Intent {
        Intent {
            id: uuid::Uuid::new_v4().to_string(),
            operation: Operation::CreatePayment,
            user: UserContext::new("user-1"),
            financial: FinancialDetails {
                amount,
                currency: "AUD".to_string(),
                categories: Vec::new(),
                sensitivity: "confidential".to_string(),
                contains_personal_data: false,
                indigenous_data: None,
            },
            request: RequestMeta {
                timestamp: Utc::now(),
                request_id: "req-1".to_string(),
                session_id: "sess-1".to_string(),
                endpoint: "/payments".to_string(),
                method: "POST".to_string(),
                justification: None,
            },
            compliance: ComplianceMeta {
                privacy_act: false,
                data_residency: "AU".to_string(),
                indigenous_protocols: None,
            },
        }
    }

    #[test]
    fn test_end_to_end_policy_lifecycle_and_evaluation() {
        let (_dir, vault) = vault();
        let author = admin(&["policy_author"]);
        let approver = admin(&["policy_approver"]);
        let deployer = admin(&["policy_deployer"]);

        vault
            .create_policy_version(
                &author,
                "spend-limit",
                spend_limit_content(10_000),
                PolicyMetadata::default(),
            )
            .unwrap();
        vault.approve_policy(&approver, "spend-limit", "1.0.0").unwrap();
        vault.deploy_policy(&deployer, "spend-limit", "1.0.0").unwrap();

        let allow = vault.evaluate(&payment_intent(5_000.0), &["spend-limit".to_string()]);
        assert!(allow.outcome.is_allow());

        let deny = vault.evaluate(&payment_intent(15_000.0), &["spend-limit".to_string()]);
        assert!(deny.outcome.is_deny());
    }

    #[test]
    fn test_unauthorized_admin_call_audited() {
        let (_dir, vault) = vault();
        let nobody = admin(&[]);

        let err = vault
            .create_policy_version(
                &nobody,
                "p1",
                spend_limit_content(1_000),
                PolicyMetadata::default(),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::Forbidden { .. }));

        let auditor = admin(&["auditor"]);
        let denied = vault
            .query_audit(
                &auditor,
                &AuditQuery::new().action(AuditAction::AccessDenied),
            )
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].result, AuditResult::Failure);
    }

    #[test]
    fn test_consent_withdrawal_blocks_automation() {
        let (_dir, vault) = vault();
        vault
            .grant_consent(
                "user-1",
                "marketing",
                ConsentLevel::FullAutomation,
                ConsentMethod::Explicit,
                None,
            )
            .unwrap();

        let intent = payment_intent(100.0);
        assert!(vault
            .evaluate_automated(&intent, "marketing", &[])
            .is_ok());

        vault.withdraw_consent("user-1", "marketing").unwrap();
        let err = vault
            .evaluate_automated(&intent, "marketing", &[])
            .unwrap_err();
        assert!(matches!(err, VaultError::ConsentInsufficient(_)));
    }

    #[test]
    fn test_read_only_mode_after_ledger_halt() {
        let (_dir, vault) = vault();
        vault.audit().halt();

        let author = admin(&["policy_author"]);
        let err = vault
            .create_policy_version(
                &author,
                "p1",
                spend_limit_content(1_000),
                PolicyMetadata::default(),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::Storage(_)));

        // Reads still work
        let auditor = admin(&["auditor"]);
        assert!(vault.query_audit(&auditor, &AuditQuery::new()).is_ok());
    }

    #[test]
    fn test_transform_surface_with_provisioned_token_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifications = HashMap::new();
        classifications.insert(
            "customer.name".to_string(),
            crate::transform::FieldMeta::new(crate::transform::Classification::Confidential)
                .tagged(crate::transform::FieldTag::PersonalIdentifier),
        );
        let vault = VaultManager::new(VaultConfig::new(dir.path()), vec![3u8; 32])
            .unwrap()
            .with_transform(classifications, crate::transform::RuleTable::empty())
            .unwrap();

        let context = crate::transform::TransformContext::new(
            "user-1",
            ConsentLevel::PartialAutomation,
        );
        let outcome = vault
            .transform(&serde_json::json!({"customer": {"name": "Alice"}}), &context)
            .unwrap();
        assert!(outcome.payload["customer"]["name"]
            .as_str()
            .unwrap()
            .starts_with("tok_"));

        // A tokenization key was provisioned in the key store
        assert_eq!(vault.keys.list(Some(KeyPurpose::Tokenization)).len(), 1);
    }

    #[test]
    fn test_integrity_key_reused_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = VaultManager::new(VaultConfig::new(dir.path()), vec![3u8; 32]).unwrap();
        let key_count = first.keys.stats().total;
        drop(first);

        let second = VaultManager::new(VaultConfig::new(dir.path()), vec![3u8; 32]).unwrap();
        assert_eq!(second.keys.stats().total, key_count);
    }
}
