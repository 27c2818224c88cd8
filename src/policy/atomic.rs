// # Atomic Policy Set
//
// Executes a batch of heterogeneous policy operations as one commit-or-
// rollback unit. Validation is deterministic and write-free; execution takes
// every affected policy lock in canonical order and compensates by restoring
// pre-transaction snapshots on any failure.

use crate::audit::{AuditAction, AuditLedger, AuditMeta, AuditResult};
use crate::error::{Result, VaultError};
use crate::policy::{PolicyContent, PolicyMetadata, PolicyVersionStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Operation kinds a transaction can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Restore,
    Delete,
}

/// One policy operation inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOperation {
    pub kind: OperationKind,
    pub policy_id: String,
    /// Content for create and update operations.
    pub content: Option<PolicyContent>,
    pub metadata: Option<PolicyMetadata>,
    /// Target version for restore operations.
    pub target_version: Option<String>,
}

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Preparing,
    Validating,
    Executing,
    Committed,
    RolledBack,
    Failed,
}

/// Per-operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub policy_id: String,
    pub kind: OperationKind,
    pub success: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// A transaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicTransaction {
    pub id: String,
    pub user_id: String,
    pub dry_run: bool,
    pub state: TransactionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<OperationResult>,
    pub error: Option<String>,
}

/// The atomic policy set executor.
pub struct AtomicPolicyExecutor {
    store: Arc<PolicyVersionStore>,
    audit: Arc<AuditLedger>,
    lock_timeout: Duration,
    transaction_timeout: Duration,
}

impl AtomicPolicyExecutor {
    pub fn new(store: Arc<PolicyVersionStore>, audit: Arc<AuditLedger>) -> Self {
        Self {
            store,
            audit,
            lock_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeouts(mut self, lock_timeout: Duration, transaction_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.transaction_timeout = transaction_timeout;
        self
    }

    /// Execute a batch of operations atomically.
    ///
    /// Structural validation failures (duplicate policy ids, malformed
    /// operations, dependency cycles) are synchronous errors raised before
    /// the transaction starts. Precondition and execution failures return a
    /// `Failed` transaction with no partial commit left visible.
    pub fn execute(
        &self,
        operations: Vec<PolicyOperation>,
        user_id: &str,
        dry_run: bool,
    ) -> Result<AtomicTransaction> {
        let started = Instant::now();
        let mut transaction = AtomicTransaction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            dry_run,
            state: TransactionState::Preparing,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
            error: None,
        };

        // Phase 1: deterministic pre-validation, no writes, no audit
        transaction.state = TransactionState::Validating;
        self.validate(&operations)?;

        // Phase 2: stable topological order over the dependency graph
        let ordered = self.topological_order(&operations)?;

        // Phase 3: dry run reports per-operation validation, no side effects
        if dry_run {
            let mut created: HashSet<&str> = HashSet::new();
            for operation in &ordered {
                let error = match operation.kind {
                    OperationKind::Create => {
                        if self.store.exists(&operation.policy_id) {
                            Some(format!("policy {} already exists", operation.policy_id))
                        } else {
                            created.insert(operation.policy_id.as_str());
                            None
                        }
                    }
                    OperationKind::Update | OperationKind::Restore | OperationKind::Delete => {
                        if self.store.exists(&operation.policy_id)
                            || created.contains(operation.policy_id.as_str())
                        {
                            None
                        } else {
                            Some(format!("policy {} not found", operation.policy_id))
                        }
                    }
                };
                transaction.results.push(OperationResult {
                    policy_id: operation.policy_id.clone(),
                    kind: operation.kind,
                    success: error.is_none(),
                    version: None,
                    error,
                });
            }
            transaction.state = TransactionState::Committed;
            transaction.finished_at = Some(Utc::now());
            return Ok(transaction);
        }

        self.audit_transaction(
            AuditAction::StartAtomicTransaction,
            &transaction,
            serde_json::json!({ "operations": ordered.len() }),
        );

        // Phase 4: execution under per-policy locks in canonical order
        transaction.state = TransactionState::Executing;
        let mut policy_ids: Vec<String> =
            ordered.iter().map(|op| op.policy_id.clone()).collect();
        policy_ids.sort();
        policy_ids.dedup();

        let locks: Vec<Arc<Mutex<()>>> = policy_ids
            .iter()
            .map(|id| self.store.lock_for(id))
            .collect();
        let mut guards: Vec<MutexGuard<'_, ()>> = Vec::with_capacity(locks.len());
        for (lock, policy_id) in locks.iter().zip(&policy_ids) {
            match lock.try_lock_for(self.lock_timeout) {
                Some(guard) => guards.push(guard),
                None => {
                    let error = format!("lock acquisition timed out for policy {}", policy_id);
                    return self.fail(transaction, error, HashMap::new());
                }
            }
        }

        // Snapshots for compensation
        let snapshots: HashMap<String, Option<Vec<crate::policy::PolicyVersion>>> = policy_ids
            .iter()
            .map(|id| (id.clone(), self.store.snapshot(id)))
            .collect();

        // Existence preconditions, checked under the locks
        if let Err(error) = self.check_preconditions(&ordered) {
            return self.fail(transaction, error.to_string(), snapshots);
        }

        for operation in &ordered {
            if started.elapsed() > self.transaction_timeout {
                return self.fail(
                    transaction,
                    "transaction timed out".to_string(),
                    snapshots,
                );
            }
            match self.apply(operation, user_id) {
                Ok(version) => transaction.results.push(OperationResult {
                    policy_id: operation.policy_id.clone(),
                    kind: operation.kind,
                    success: true,
                    version,
                    error: None,
                }),
                Err(error) => {
                    transaction.results.push(OperationResult {
                        policy_id: operation.policy_id.clone(),
                        kind: operation.kind,
                        success: false,
                        version: None,
                        error: Some(error.to_string()),
                    });
                    return self.fail(transaction, error.to_string(), snapshots);
                }
            }
        }

        // Phase 5: commit
        drop(guards);
        transaction.state = TransactionState::Committed;
        transaction.finished_at = Some(Utc::now());
        self.audit_transaction(
            AuditAction::CompleteAtomicTransaction,
            &transaction,
            serde_json::json!({
                "results": transaction
                    .results
                    .iter()
                    .map(|r| serde_json::json!({
                        "policyId": r.policy_id,
                        "kind": r.kind,
                        "version": r.version,
                    }))
                    .collect::<Vec<_>>(),
            }),
        );
        tracing::info!(txn = %transaction.id, ops = transaction.results.len(), "atomic transaction committed");
        Ok(transaction)
    }

    fn validate(&self, operations: &[PolicyOperation]) -> Result<()> {
        if operations.is_empty() {
            return Err(VaultError::InvalidInput(
                "transaction carries no operations".to_string(),
            ));
        }

        // Duplicate policy ids
        let mut seen = HashSet::new();
        for operation in operations {
            if !seen.insert(operation.policy_id.clone()) {
                return Err(VaultError::DuplicatePolicyId(operation.policy_id.clone()));
            }
        }

        // Shape checks; existence is verified under the transaction locks
        for operation in operations {
            match operation.kind {
                OperationKind::Create | OperationKind::Update => {
                    if operation.content.is_none() {
                        return Err(VaultError::InvalidInput(format!(
                            "{:?} for {} carries no content",
                            operation.kind, operation.policy_id
                        )));
                    }
                }
                OperationKind::Restore => {
                    if operation.target_version.is_none() {
                        return Err(VaultError::InvalidInput(format!(
                            "restore for {} names no target version",
                            operation.policy_id
                        )));
                    }
                }
                OperationKind::Delete => {}
            }
        }

        Ok(())
    }

    fn check_preconditions(&self, operations: &[PolicyOperation]) -> Result<()> {
        // Policies created earlier in the same transaction satisfy later
        // preconditions.
        let mut created: HashSet<&str> = HashSet::new();
        for operation in operations {
            match operation.kind {
                OperationKind::Create => {
                    if self.store.exists(&operation.policy_id) {
                        return Err(VaultError::Conflict(format!(
                            "policy {} already exists",
                            operation.policy_id
                        )));
                    }
                    created.insert(operation.policy_id.as_str());
                }
                OperationKind::Update | OperationKind::Restore | OperationKind::Delete => {
                    if !self.store.exists(&operation.policy_id)
                        && !created.contains(operation.policy_id.as_str())
                    {
                        return Err(VaultError::NotFound(format!(
                            "policy {} not found",
                            operation.policy_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over declared dependencies, combining the batch with
    /// already-active policies. Ties break by original operation index.
    fn topological_order(&self, operations: &[PolicyOperation]) -> Result<Vec<PolicyOperation>> {
        let batch_ids: HashMap<&str, usize> = operations
            .iter()
            .enumerate()
            .map(|(index, op)| (op.policy_id.as_str(), index))
            .collect();

        // dependencies[i] = indices of batch operations that must run first
        let mut incoming: Vec<HashSet<usize>> = vec![HashSet::new(); operations.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); operations.len()];

        for (index, operation) in operations.iter().enumerate() {
            let declared = operation
                .content
                .as_ref()
                .map(|content| content.dependencies.clone())
                .unwrap_or_default();
            for dependency in declared {
                if let Some(&dep_index) = batch_ids.get(dependency.as_str()) {
                    incoming[index].insert(dep_index);
                    outgoing[dep_index].push(index);
                } else if !self.store.exists(&dependency) {
                    return Err(VaultError::NotFound(format!(
                        "policy {} depends on unknown policy {}",
                        operation.policy_id, dependency
                    )));
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..operations.len())
            .filter(|&index| incoming[index].is_empty())
            .collect();
        let mut ordered = Vec::with_capacity(operations.len());

        while let Some(index) = ready.pop_front() {
            ordered.push(operations[index].clone());
            for &dependent in &outgoing[index] {
                incoming[dependent].remove(&index);
                if incoming[dependent].is_empty() {
                    // Stable: insert keeping original index order
                    let position = ready
                        .iter()
                        .position(|&queued| queued > dependent)
                        .unwrap_or(ready.len());
                    ready.insert(position, dependent);
                }
            }
        }

        if ordered.len() != operations.len() {
            let cyclic: Vec<&str> = operations
                .iter()
                .enumerate()
                .filter(|(index, _)| !incoming[*index].is_empty())
                .map(|(_, op)| op.policy_id.as_str())
                .collect();
            return Err(VaultError::CircularDependency(format!(
                "dependency cycle among policies: {}",
                cyclic.join(", ")
            )));
        }
        Ok(ordered)
    }

    fn apply(&self, operation: &PolicyOperation, user_id: &str) -> Result<Option<String>> {
        match operation.kind {
            OperationKind::Create | OperationKind::Update => {
                let content = operation
                    .content
                    .clone()
                    .ok_or_else(|| VaultError::InvalidInput("operation carries no content".to_string()))?;
                let metadata = operation.metadata.clone().unwrap_or_default();
                let version =
                    self.store
                        .create_version(&operation.policy_id, content, metadata, user_id)?;
                Ok(Some(version.version))
            }
            OperationKind::Restore => {
                let target = operation
                    .target_version
                    .as_deref()
                    .ok_or_else(|| VaultError::InvalidInput("restore names no target".to_string()))?;
                // The transaction already holds this policy's advisory lock
                let version = self
                    .store
                    .restore_unlocked(&operation.policy_id, target, user_id)?;
                Ok(Some(version.version))
            }
            OperationKind::Delete => {
                self.store.delete_policy(&operation.policy_id, user_id)?;
                Ok(None)
            }
        }
    }

    fn fail(
        &self,
        mut transaction: AtomicTransaction,
        error: String,
        snapshots: HashMap<String, Option<Vec<crate::policy::PolicyVersion>>>,
    ) -> Result<AtomicTransaction> {
        // Compensate: put every touched policy back exactly as it was
        for (policy_id, snapshot) in snapshots {
            self.store.restore_snapshot(&policy_id, snapshot);
        }

        transaction.state = TransactionState::Failed;
        transaction.error = Some(error.clone());
        transaction.finished_at = Some(Utc::now());

        self.audit_transaction(
            AuditAction::FailAtomicTransaction,
            &transaction,
            serde_json::json!({ "error": error }),
        );
        tracing::warn!(txn = %transaction.id, error = %error, "atomic transaction rolled back");
        Ok(transaction)
    }

    fn audit_transaction(&self, action: AuditAction, transaction: &AtomicTransaction, details: Value) {
        let result = match action {
            AuditAction::FailAtomicTransaction => AuditResult::Failure,
            _ => AuditResult::Success,
        };
        let _ = self.audit.record(
            &transaction.user_id,
            action,
            &transaction.id,
            details,
            result,
            AuditMeta::default(),
        );
    }
}
