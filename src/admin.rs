// # Administrative Authorization
//
// Every administrative operation carries an AdminContext and is checked
// against a required-role table. Unauthorized calls fail with Forbidden
// naming the missing role, and are audited by the caller.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};

/// Identity and transport context of an administrative caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminContext {
    pub actor_id: String,
    pub session_id: String,
    pub request_id: String,
    pub ip_address: String,
    pub roles: Vec<String>,
}

impl AdminContext {
    pub fn new(actor_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            session_id: String::new(),
            request_id: String::new(),
            ip_address: String::new(),
            roles,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Administrative operations gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminOperation {
    CreatePolicyVersion,
    ApprovePolicy,
    DeployPolicy,
    ArchivePolicy,
    RestorePolicy,
    ExecuteAtomicSet,
    CreateRollbackPlan,
    ValidateRollbackPlan,
    ApproveRollbackPlan,
    ExecuteRollback,
    ListKeys,
    RotateKey,
    RevokeKey,
    BackupKeys,
    RestoreKeys,
    QueryAudit,
    VerifyAudit,
}

impl AdminOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminOperation::CreatePolicyVersion => "create_policy_version",
            AdminOperation::ApprovePolicy => "approve_policy",
            AdminOperation::DeployPolicy => "deploy_policy",
            AdminOperation::ArchivePolicy => "archive_policy",
            AdminOperation::RestorePolicy => "restore_policy",
            AdminOperation::ExecuteAtomicSet => "execute_atomic_set",
            AdminOperation::CreateRollbackPlan => "create_rollback_plan",
            AdminOperation::ValidateRollbackPlan => "validate_rollback_plan",
            AdminOperation::ApproveRollbackPlan => "approve_rollback_plan",
            AdminOperation::ExecuteRollback => "execute_rollback",
            AdminOperation::ListKeys => "list_keys",
            AdminOperation::RotateKey => "rotate_key",
            AdminOperation::RevokeKey => "revoke_key",
            AdminOperation::BackupKeys => "backup_keys",
            AdminOperation::RestoreKeys => "restore_keys",
            AdminOperation::QueryAudit => "query_audit",
            AdminOperation::VerifyAudit => "verify_audit",
        }
    }

    /// The role each operation requires.
    pub fn required_role(&self) -> &'static str {
        match self {
            AdminOperation::CreatePolicyVersion => "policy_author",
            AdminOperation::ApprovePolicy => "policy_approver",
            AdminOperation::DeployPolicy => "policy_deployer",
            AdminOperation::ArchivePolicy => "policy_deployer",
            AdminOperation::RestorePolicy => "policy_deployer",
            AdminOperation::ExecuteAtomicSet => "policy_deployer",
            AdminOperation::CreateRollbackPlan => "rollback_planner",
            AdminOperation::ValidateRollbackPlan => "rollback_planner",
            AdminOperation::ApproveRollbackPlan => "rollback_approver",
            AdminOperation::ExecuteRollback => "rollback_executor",
            AdminOperation::ListKeys => "key_custodian",
            AdminOperation::RotateKey => "key_custodian",
            AdminOperation::RevokeKey => "key_custodian",
            AdminOperation::BackupKeys => "key_custodian",
            AdminOperation::RestoreKeys => "key_custodian",
            AdminOperation::QueryAudit => "auditor",
            AdminOperation::VerifyAudit => "auditor",
        }
    }
}

/// Check a caller's roles against the operation's requirement.
pub fn authorize(context: &AdminContext, operation: AdminOperation) -> Result<()> {
    let required = operation.required_role();
    if context.has_role(required) {
        Ok(())
    } else {
        Err(VaultError::missing_role(operation.as_str(), required))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorized_role_passes() {
        let context = AdminContext::new("ops", vec!["policy_deployer".to_string()]);
        assert!(authorize(&context, AdminOperation::DeployPolicy).is_ok());
    }

    #[test]
    fn test_missing_role_is_forbidden() {
        let context = AdminContext::new("ops", vec!["policy_author".to_string()]);
        let err = authorize(&context, AdminOperation::ExecuteRollback).unwrap_err();
        let VaultError::Forbidden {
            required_role, ..
        } = err
        else {
            panic!("expected forbidden");
        };
        assert_eq!(required_role.as_deref(), Some("rollback_executor"));
    }

    #[test]
    fn test_role_table() {
        assert_eq!(
            AdminOperation::DeployPolicy.required_role(),
            "policy_deployer"
        );
        assert_eq!(
            AdminOperation::ExecuteRollback.required_role(),
            "rollback_executor"
        );
        assert_eq!(AdminOperation::BackupKeys.required_role(), "key_custodian");
    }
}
