// Atomic Policy Set Integration Test
//
// Dependency-ordered multi-policy transactions: commit paths in either
// input order, compensation on failure, circular dependency rejection, and
// the audit trail each path leaves behind.

use policy_vault::admin::AdminContext;
use policy_vault::audit::{AuditAction, AuditQuery};
use policy_vault::policy::{
    Condition, OperationKind, PolicyContent, PolicyMetadata, PolicyOperation, PolicyRule,
    PolicyRuleKind, TransactionState, VersionStatus,
};
use policy_vault::{VaultConfig, VaultError, VaultManager};

fn vault() -> (tempfile::TempDir, VaultManager) {
    let dir = tempfile::tempdir().unwrap();
    let manager = VaultManager::new(VaultConfig::new(dir.path()), vec![5u8; 32]).unwrap();
    (dir, manager)
}

fn admin() -> AdminContext {
    AdminContext::new(
        "admin-1",
        vec!["policy_deployer".to_string(), "auditor".to_string()],
    )
}

fn content(dependencies: Vec<&str>) -> PolicyContent {
    PolicyContent {
        rules: vec![PolicyRule {
            id: "r1".to_string(),
            kind: PolicyRuleKind::Allow,
            condition: Condition::Always,
            reason: "default allow".to_string(),
            conditions: Vec::new(),
            obligations: Vec::new(),
        }],
        data: serde_json::Value::Null,
        config: Default::default(),
        dependencies: dependencies.into_iter().map(str::to_string).collect(),
        constraints: Vec::new(),
    }
}

fn create_op(policy_id: &str, dependencies: Vec<&str>) -> PolicyOperation {
    PolicyOperation {
        kind: OperationKind::Create,
        policy_id: policy_id.to_string(),
        content: Some(content(dependencies)),
        metadata: Some(PolicyMetadata::default()),
        target_version: None,
    }
}

fn audit_actions(vault: &VaultManager) -> Vec<String> {
    vault
        .query_audit(&admin(), &AuditQuery::new())
        .unwrap()
        .iter()
        .map(|e| e.action.as_str().to_string())
        .collect()
}

#[test]
fn dependent_create_commits_in_dependency_order() {
    let (_dir, vault) = vault();

    let txn = vault
        .execute_atomic_set(
            &admin(),
            vec![
                create_op("dependent", vec!["base"]),
                create_op("base", vec![]),
            ],
            false,
        )
        .unwrap();

    assert_eq!(txn.state, TransactionState::Committed);
    assert_eq!(txn.results[0].policy_id, "base");
    assert_eq!(txn.results[1].policy_id, "dependent");

    let base = vault.store().get_latest("base").unwrap();
    assert_eq!(base.version, "1.0.0");
    assert_eq!(base.status, VersionStatus::Draft);

    assert_eq!(
        audit_actions(&vault),
        vec![
            "START_ATOMIC_TRANSACTION",
            "CREATE_POLICY",
            "CREATE_POLICY",
            "COMPLETE_ATOMIC_TRANSACTION",
        ]
    );
}

#[test]
fn reversed_input_order_gives_identical_result() {
    let (_dir, vault) = vault();

    let txn = vault
        .execute_atomic_set(
            &admin(),
            vec![
                create_op("base", vec![]),
                create_op("dependent", vec!["base"]),
            ],
            false,
        )
        .unwrap();

    assert_eq!(txn.state, TransactionState::Committed);
    assert_eq!(txn.results[0].policy_id, "base");
    assert_eq!(txn.results[1].policy_id, "dependent");
    assert_eq!(
        vault.store().get_latest("base").unwrap().status,
        VersionStatus::Draft
    );
}

#[test]
fn failed_operation_rolls_back_the_whole_transaction() {
    let (_dir, vault) = vault();

    let txn = vault
        .execute_atomic_set(
            &admin(),
            vec![
                create_op("valid", vec![]),
                PolicyOperation {
                    kind: OperationKind::Update,
                    policy_id: "nonexistent".to_string(),
                    content: Some(content(vec![])),
                    metadata: None,
                    target_version: None,
                },
            ],
            false,
        )
        .unwrap();

    assert_eq!(txn.state, TransactionState::Failed);
    // No policy named "valid" observable afterward
    assert!(!vault.store().exists("valid"));

    let failures = vault
        .query_audit(
            &admin(),
            &AuditQuery::new().action(AuditAction::FailAtomicTransaction),
        )
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].details["error"]
        .as_str()
        .unwrap()
        .contains("not found"));
}

#[test]
fn circular_dependency_fails_synchronously() {
    let (_dir, vault) = vault();

    let err = vault
        .execute_atomic_set(
            &admin(),
            vec![create_op("a", vec!["b"]), create_op("b", vec!["a"])],
            false,
        )
        .unwrap_err();
    assert!(matches!(err, VaultError::CircularDependency(_)));

    // No transaction start was committed to the ledger
    let starts = vault
        .query_audit(
            &admin(),
            &AuditQuery::new().action(AuditAction::StartAtomicTransaction),
        )
        .unwrap();
    assert!(starts.is_empty());
}

#[test]
fn duplicate_policy_ids_rejected() {
    let (_dir, vault) = vault();

    let err = vault
        .execute_atomic_set(
            &admin(),
            vec![create_op("dup", vec![]), create_op("dup", vec![])],
            false,
        )
        .unwrap_err();
    assert!(matches!(err, VaultError::DuplicatePolicyId(_)));
}

#[test]
fn dry_run_reports_without_side_effects() {
    let (_dir, vault) = vault();

    let txn = vault
        .execute_atomic_set(
            &admin(),
            vec![create_op("base", vec![]), create_op("child", vec!["base"])],
            true,
        )
        .unwrap();

    assert_eq!(txn.state, TransactionState::Committed);
    assert!(txn.dry_run);
    assert_eq!(txn.results.len(), 2);
    assert!(txn.results.iter().all(|r| r.success));
    assert!(!vault.store().exists("base"));
    assert!(!vault.store().exists("child"));
    assert!(audit_actions(&vault).is_empty());
}

#[test]
fn three_level_dependency_chain_orders_correctly() {
    let (_dir, vault) = vault();

    let txn = vault
        .execute_atomic_set(
            &admin(),
            vec![
                create_op("leaf", vec!["middle"]),
                create_op("root", vec![]),
                create_op("middle", vec!["root"]),
            ],
            false,
        )
        .unwrap();

    assert_eq!(txn.state, TransactionState::Committed);
    let order: Vec<&str> = txn.results.iter().map(|r| r.policy_id.as_str()).collect();
    assert_eq!(order, vec!["root", "middle", "leaf"]);
}

#[test]
fn no_transaction_version_survives_a_failure() {
    let (_dir, vault) = vault();

    vault
        .execute_atomic_set(&admin(), vec![create_op("seed", vec![])], false)
        .unwrap();

    let txn = vault
        .execute_atomic_set(
            &admin(),
            vec![
                PolicyOperation {
                    kind: OperationKind::Update,
                    policy_id: "seed".to_string(),
                    content: Some(content(vec![])),
                    metadata: None,
                    target_version: None,
                },
                PolicyOperation {
                    kind: OperationKind::Restore,
                    policy_id: "seed".to_string(),
                    content: None,
                    metadata: None,
                    target_version: Some("8.8.8".to_string()),
                },
            ],
            false,
        )
        .unwrap_err();
    // Same policy twice is a duplicate id
    assert!(matches!(txn, VaultError::DuplicatePolicyId(_)));

    // Now a two-policy batch where the second op fails mid-execution
    let failed = vault
        .execute_atomic_set(
            &admin(),
            vec![
                create_op("fresh", vec![]),
                PolicyOperation {
                    kind: OperationKind::Restore,
                    policy_id: "seed".to_string(),
                    content: None,
                    metadata: None,
                    target_version: Some("8.8.8".to_string()),
                },
            ],
            false,
        )
        .unwrap();
    assert_eq!(failed.state, TransactionState::Failed);

    // "seed" keeps exactly its pre-transaction single version; "fresh" is gone
    assert_eq!(vault.store().list_versions("seed").len(), 1);
    assert!(!vault.store().exists("fresh"));
    let statuses: Vec<VersionStatus> = vault
        .store()
        .list_versions("seed")
        .iter()
        .map(|v| v.status)
        .collect();
    assert_eq!(statuses, vec![VersionStatus::Draft]);
}
