// # Policy Version Store
//
// Owns the PolicyVersion lifecycle. Versions are immutable artifacts; the
// store only ever appends versions and moves statuses. Deploys are
// serialized per policy id by an advisory lock; reads are lock-free
// snapshots. Every mutation lands in the change log (consumed by rollback
// conflict detection) and the audit ledger.

use crate::audit::{canonical_string, AuditAction, AuditLedger, AuditMeta, AuditResult};
use crate::error::{Result, VaultError};
use crate::policy::{
    compare_semver, next_semver, ChangeType, PolicyContent, PolicyMetadata, PolicyVersion,
    VersionStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One administrative mutation, recorded for conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyChange {
    pub id: String,
    pub policy_id: String,
    pub version: String,
    pub action: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// The policy version store.
pub struct PolicyVersionStore {
    versions: RwLock<HashMap<String, Vec<PolicyVersion>>>,
    // Advisory per-policy locks; also taken by the atomic executor
    locks: DashMap<String, Arc<Mutex<()>>>,
    lock_timeout: Duration,
    change_log: RwLock<Vec<PolicyChange>>,
    audit: RwLock<Option<Arc<AuditLedger>>>,
    // Bumped on every ACTIVE transition; folded into decision cache keys
    activation_generation: AtomicU64,
}

impl PolicyVersionStore {
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
            lock_timeout: Duration::from_secs(30),
            change_log: RwLock::new(Vec::new()),
            audit: RwLock::new(None),
            activation_generation: AtomicU64::new(0),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn set_audit(&self, audit: Arc<AuditLedger>) {
        *self.audit.write() = Some(audit);
    }

    /// Advisory lock handle for a policy id. The atomic executor acquires
    /// these in canonical order.
    pub fn lock_for(&self, policy_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(policy_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Generation counter observed by the decision cache. Any version
    /// reaching ACTIVE bumps it.
    pub fn activation_generation(&self) -> u64 {
        self.activation_generation.load(Ordering::SeqCst)
    }

    pub fn bump_activation_generation(&self) {
        self.activation_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Create a new DRAFT version. The version number follows the metadata
    /// change type: creation starts at 1.0.0, updates bump the minor, major
    /// and breaking changes bump the major.
    pub fn create_version(
        &self,
        policy_id: &str,
        content: PolicyContent,
        metadata: PolicyMetadata,
        actor: &str,
    ) -> Result<PolicyVersion> {
        let latest = self.get_latest(policy_id);
        let change_type = match (&latest, metadata.change_type) {
            (None, _) => ChangeType::Creation,
            (Some(_), Some(change_type)) => change_type,
            (Some(_), None) => ChangeType::Update,
        };
        if latest.is_some() && change_type == ChangeType::Creation {
            return Err(VaultError::Conflict(format!(
                "policy {} already exists",
                policy_id
            )));
        }

        let version = next_semver(latest.as_ref().map(|v| v.version.as_str()), change_type)?;
        let artifact = PolicyVersion {
            id: Uuid::new_v4().to_string(),
            policy_id: policy_id.to_string(),
            version: version.clone(),
            hash: content_hash(&content)?,
            content,
            metadata,
            parent_version: latest.map(|v| v.version),
            tags: Vec::new(),
            created_at: Utc::now(),
            created_by: actor.to_string(),
            status: VersionStatus::Draft,
        };

        self.versions
            .write()
            .entry(policy_id.to_string())
            .or_default()
            .push(artifact.clone());

        self.log_change(policy_id, &version, "create", actor);
        self.audit_mutation(
            AuditAction::CreatePolicy,
            policy_id,
            actor,
            serde_json::json!({ "version": version }),
        );
        tracing::info!(policy_id, version = %artifact.version, "policy version created");
        Ok(artifact)
    }

    /// Approve a DRAFT version. The approver is recorded and joins the
    /// reviewer set, keeping the approved-implies-reviewed invariant.
    pub fn approve(&self, policy_id: &str, version: &str, approver: &str) -> Result<PolicyVersion> {
        let updated = self.transition(policy_id, version, |artifact| {
            if artifact.status != VersionStatus::Draft {
                return Err(VaultError::PreconditionFailed(format!(
                    "approve requires DRAFT, {} {} is {:?}",
                    policy_id, version, artifact.status
                )));
            }
            artifact.status = VersionStatus::Approved;
            artifact.metadata.approved_by = Some(approver.to_string());
            if !artifact.metadata.reviewers.iter().any(|r| r == approver) {
                artifact.metadata.reviewers.push(approver.to_string());
            }
            Ok(())
        })?;

        self.log_change(policy_id, version, "approve", approver);
        self.audit_mutation(
            AuditAction::ApprovePolicy,
            policy_id,
            approver,
            serde_json::json!({ "version": version }),
        );
        Ok(updated)
    }

    /// Deploy an APPROVED version: the prior ACTIVE (if any) is archived and
    /// the named version becomes ACTIVE, atomically under the policy lock.
    pub fn deploy(&self, policy_id: &str, version: &str, actor: &str) -> Result<PolicyVersion> {
        let lock = self.lock_for(policy_id);
        let guard = lock.try_lock_for(self.lock_timeout).ok_or_else(|| {
            VaultError::Conflict(format!("deploy contested for policy {}", policy_id))
        })?;

        let mut versions = self.versions.write();
        let history = versions
            .get_mut(policy_id)
            .ok_or_else(|| VaultError::NotFound(format!("policy {}", policy_id)))?;

        let target_index = history
            .iter()
            .position(|v| v.version == version)
            .ok_or_else(|| {
                VaultError::NotFound(format!("policy {} version {}", policy_id, version))
            })?;
        if history[target_index].status != VersionStatus::Approved {
            return Err(VaultError::PreconditionFailed(format!(
                "deploy requires APPROVED, {} {} is {:?}",
                policy_id, version, history[target_index].status
            )));
        }

        let mut archived_version = None;
        for artifact in history.iter_mut() {
            if artifact.status == VersionStatus::Active {
                artifact.status = VersionStatus::Archived;
                archived_version = Some(artifact.version.clone());
            }
        }
        history[target_index].status = VersionStatus::Active;
        let deployed = history[target_index].clone();
        drop(versions);
        drop(guard);

        self.bump_activation_generation();
        self.log_change(policy_id, version, "deploy", actor);
        self.audit_mutation(
            AuditAction::DeployPolicy,
            policy_id,
            actor,
            serde_json::json!({ "version": version, "archived": archived_version }),
        );
        tracing::info!(policy_id, version, "policy deployed");
        Ok(deployed)
    }

    /// Archive a non-ACTIVE version.
    pub fn archive(&self, policy_id: &str, version: &str, actor: &str) -> Result<PolicyVersion> {
        let updated = self.transition(policy_id, version, |artifact| {
            if artifact.status == VersionStatus::Active {
                return Err(VaultError::PreconditionFailed(format!(
                    "cannot archive ACTIVE version {} of {}",
                    version, policy_id
                )));
            }
            artifact.status = VersionStatus::Archived;
            Ok(())
        })?;

        self.log_change(policy_id, version, "archive", actor);
        self.audit_mutation(
            AuditAction::ArchivePolicy,
            policy_id,
            actor,
            serde_json::json!({ "version": version }),
        );
        Ok(updated)
    }

    /// Restore a prior version: a new ACTIVE version is created with the
    /// target's content; the displaced ACTIVE becomes the rollback target.
    pub fn restore(
        &self,
        policy_id: &str,
        target_version: &str,
        actor: &str,
    ) -> Result<PolicyVersion> {
        let lock = self.lock_for(policy_id);
        let _guard = lock.try_lock_for(self.lock_timeout).ok_or_else(|| {
            VaultError::Conflict(format!("restore contested for policy {}", policy_id))
        })?;
        self.restore_unlocked(policy_id, target_version, actor)
    }

    /// Restore body for callers that already hold the policy's advisory
    /// lock, such as the atomic executor.
    pub(crate) fn restore_unlocked(
        &self,
        policy_id: &str,
        target_version: &str,
        actor: &str,
    ) -> Result<PolicyVersion> {
        let mut versions = self.versions.write();
        let history = versions
            .get_mut(policy_id)
            .ok_or_else(|| VaultError::NotFound(format!("policy {}", policy_id)))?;

        let target = history
            .iter()
            .find(|v| v.version == target_version)
            .cloned()
            .ok_or_else(|| {
                VaultError::NotFound(format!(
                    "policy {} version {}",
                    policy_id, target_version
                ))
            })?;

        let latest_version = history
            .iter()
            .map(|v| v.version.clone())
            .try_fold(None::<String>, |best, candidate| {
                Ok::<_, VaultError>(match best {
                    Some(best)
                        if compare_semver(&best, &candidate)? == std::cmp::Ordering::Greater =>
                    {
                        Some(best)
                    }
                    _ => Some(candidate),
                })
            })?;

        for artifact in history.iter_mut() {
            if artifact.status == VersionStatus::Active {
                artifact.status = VersionStatus::RollbackTarget;
            }
        }

        let restored = PolicyVersion {
            id: Uuid::new_v4().to_string(),
            policy_id: policy_id.to_string(),
            version: next_semver(latest_version.as_deref(), ChangeType::Update)?,
            hash: target.hash.clone(),
            content: target.content.clone(),
            metadata: PolicyMetadata {
                title: target.metadata.title.clone(),
                description: format!("restored from version {}", target_version),
                change_type: Some(ChangeType::Update),
                ..PolicyMetadata::default()
            },
            parent_version: Some(target.version.clone()),
            tags: vec!["rollback".to_string()],
            created_at: Utc::now(),
            created_by: actor.to_string(),
            status: VersionStatus::Active,
        };
        let restored_version = restored.version.clone();
        history.push(restored.clone());
        drop(versions);

        self.bump_activation_generation();
        self.log_change(policy_id, &restored_version, "restore", actor);
        self.audit_mutation(
            AuditAction::RestorePolicy,
            policy_id,
            actor,
            serde_json::json!({ "version": restored_version, "restored_from": target_version }),
        );
        tracing::info!(policy_id, from = target_version, "policy restored");
        Ok(restored)
    }

    /// Remove a policy and all its versions. Returns the removed history so
    /// a failed transaction can reinstate it.
    pub fn delete_policy(&self, policy_id: &str, actor: &str) -> Result<Vec<PolicyVersion>> {
        let removed = self
            .versions
            .write()
            .remove(policy_id)
            .ok_or_else(|| VaultError::NotFound(format!("policy {}", policy_id)))?;

        self.bump_activation_generation();
        self.log_change(policy_id, "", "delete", actor);
        self.audit_mutation(
            AuditAction::DeletePolicy,
            policy_id,
            actor,
            serde_json::json!({ "versions_removed": removed.len() }),
        );
        Ok(removed)
    }

    /// Latest version by semver precedence.
    pub fn get_latest(&self, policy_id: &str) -> Option<PolicyVersion> {
        let versions = self.versions.read();
        let history = versions.get(policy_id)?;
        let mut best: Option<&PolicyVersion> = None;
        for candidate in history {
            best = match best {
                Some(current)
                    if compare_semver(&current.version, &candidate.version)
                        .map(|o| o.is_ge())
                        .unwrap_or(true) =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }
        best.cloned()
    }

    pub fn get_version(&self, policy_id: &str, version: &str) -> Option<PolicyVersion> {
        self.versions
            .read()
            .get(policy_id)?
            .iter()
            .find(|v| v.version == version)
            .cloned()
    }

    /// The unique ACTIVE version for a policy id, if any.
    pub fn get_active(&self, policy_id: &str) -> Option<PolicyVersion> {
        self.versions
            .read()
            .get(policy_id)?
            .iter()
            .find(|v| v.status == VersionStatus::Active)
            .cloned()
    }

    pub fn list_versions(&self, policy_id: &str) -> Vec<PolicyVersion> {
        self.versions
            .read()
            .get(policy_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All ACTIVE versions across policies.
    pub fn list_active(&self) -> Vec<PolicyVersion> {
        self.versions
            .read()
            .values()
            .flat_map(|history| {
                history
                    .iter()
                    .filter(|v| v.status == VersionStatus::Active)
                    .cloned()
            })
            .collect()
    }

    pub fn exists(&self, policy_id: &str) -> bool {
        self.versions.read().contains_key(policy_id)
    }

    /// Full history snapshot for transactional compensation.
    pub fn snapshot(&self, policy_id: &str) -> Option<Vec<PolicyVersion>> {
        self.versions.read().get(policy_id).cloned()
    }

    /// Reinstate a snapshot taken by `snapshot`. `None` removes the policy.
    pub fn restore_snapshot(&self, policy_id: &str, snapshot: Option<Vec<PolicyVersion>>) {
        let mut versions = self.versions.write();
        match snapshot {
            Some(history) => {
                versions.insert(policy_id.to_string(), history);
            }
            None => {
                versions.remove(policy_id);
            }
        }
    }

    /// Changes touching any of `policy_ids` at or after `since`.
    pub fn changes_since(&self, policy_ids: &[String], since: DateTime<Utc>) -> Vec<PolicyChange> {
        self.change_log
            .read()
            .iter()
            .filter(|change| change.timestamp >= since)
            .filter(|change| policy_ids.iter().any(|id| id == &change.policy_id))
            .cloned()
            .collect()
    }

    fn transition(
        &self,
        policy_id: &str,
        version: &str,
        mutate: impl FnOnce(&mut PolicyVersion) -> Result<()>,
    ) -> Result<PolicyVersion> {
        let mut versions = self.versions.write();
        let history = versions
            .get_mut(policy_id)
            .ok_or_else(|| VaultError::NotFound(format!("policy {}", policy_id)))?;
        let artifact = history
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                VaultError::NotFound(format!("policy {} version {}", policy_id, version))
            })?;
        mutate(artifact)?;
        Ok(artifact.clone())
    }

    fn log_change(&self, policy_id: &str, version: &str, action: &str, actor: &str) {
        self.change_log.write().push(PolicyChange {
            id: Uuid::new_v4().to_string(),
            policy_id: policy_id.to_string(),
            version: version.to_string(),
            action: action.to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn audit_mutation(
        &self,
        action: AuditAction,
        policy_id: &str,
        actor: &str,
        details: serde_json::Value,
    ) {
        if let Some(ref ledger) = *self.audit.read() {
            let _ = ledger.record(
                actor,
                action,
                policy_id,
                details,
                AuditResult::Success,
                AuditMeta::default(),
            );
        }
    }
}

impl Default for PolicyVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn content_hash(content: &PolicyContent) -> Result<String> {
    let value = serde_json::to_value(content)?;
    Ok(hex::encode(Sha256::digest(
        canonical_string(&value).as_bytes(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Condition, PolicyRule, PolicyRuleKind};

    fn simple_content() -> PolicyContent {
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
            dependencies: Vec::new(),
            constraints: Vec::new(),
        }
    }

    fn draft(store: &PolicyVersionStore, policy_id: &str) -> PolicyVersion {
        store
            .create_version(policy_id, simple_content(), PolicyMetadata::default(), "author")
            .unwrap()
    }

    #[test]
    fn test_create_starts_at_one() {
        let store = PolicyVersionStore::new();
        let version = draft(&store, "p1");
        assert_eq!(version.version, "1.0.0");
        assert_eq!(version.status, VersionStatus::Draft);
        assert!(version.parent_version.is_none());
        assert!(!version.hash.is_empty());
    }

    #[test]
    fn test_update_bumps_minor() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");
        let metadata = PolicyMetadata {
            change_type: Some(ChangeType::Update),
            ..Default::default()
        };
        let second = store
            .create_version("p1", simple_content(), metadata, "author")
            .unwrap();
        assert_eq!(second.version, "1.1.0");
        assert_eq!(second.parent_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_lifecycle_draft_approve_deploy() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");

        // Deploy before approve fails
        let err = store.deploy("p1", "1.0.0", "ops").unwrap_err();
        assert!(matches!(err, VaultError::PreconditionFailed(_)));

        let approved = store.approve("p1", "1.0.0", "reviewer").unwrap();
        assert_eq!(approved.status, VersionStatus::Approved);
        assert!(!approved.metadata.reviewers.is_empty());

        let deployed = store.deploy("p1", "1.0.0", "ops").unwrap();
        assert_eq!(deployed.status, VersionStatus::Active);
        assert_eq!(store.get_active("p1").unwrap().version, "1.0.0");
    }

    #[test]
    fn test_deploy_archives_prior_active() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");
        store.approve("p1", "1.0.0", "reviewer").unwrap();
        store.deploy("p1", "1.0.0", "ops").unwrap();

        let metadata = PolicyMetadata {
            change_type: Some(ChangeType::Update),
            ..Default::default()
        };
        store
            .create_version("p1", simple_content(), metadata, "author")
            .unwrap();
        store.approve("p1", "1.1.0", "reviewer").unwrap();
        store.deploy("p1", "1.1.0", "ops").unwrap();

        let actives: Vec<_> = store
            .list_versions("p1")
            .into_iter()
            .filter(|v| v.status == VersionStatus::Active)
            .collect();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].version, "1.1.0");
        assert_eq!(
            store.get_version("p1", "1.0.0").unwrap().status,
            VersionStatus::Archived
        );
    }

    #[test]
    fn test_cannot_archive_active() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");
        store.approve("p1", "1.0.0", "reviewer").unwrap();
        store.deploy("p1", "1.0.0", "ops").unwrap();

        let err = store.archive("p1", "1.0.0", "ops").unwrap_err();
        assert!(matches!(err, VaultError::PreconditionFailed(_)));
    }

    #[test]
    fn test_restore_creates_active_copy() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");
        store.approve("p1", "1.0.0", "reviewer").unwrap();
        store.deploy("p1", "1.0.0", "ops").unwrap();

        let metadata = PolicyMetadata {
            change_type: Some(ChangeType::Update),
            ..Default::default()
        };
        store
            .create_version("p1", simple_content(), metadata, "author")
            .unwrap();
        store.approve("p1", "1.1.0", "reviewer").unwrap();
        store.deploy("p1", "1.1.0", "ops").unwrap();

        let restored = store.restore("p1", "1.0.0", "ops").unwrap();
        assert_eq!(restored.status, VersionStatus::Active);
        assert_eq!(restored.version, "1.2.0");
        assert_eq!(
            restored.hash,
            store.get_version("p1", "1.0.0").unwrap().hash
        );
        // Displaced active becomes the rollback target
        assert_eq!(
            store.get_version("p1", "1.1.0").unwrap().status,
            VersionStatus::RollbackTarget
        );
        // Still exactly one active
        let actives: Vec<_> = store
            .list_versions("p1")
            .into_iter()
            .filter(|v| v.status == VersionStatus::Active)
            .collect();
        assert_eq!(actives.len(), 1);
    }

    #[test]
    fn test_activation_generation_bumps_on_deploy() {
        let store = PolicyVersionStore::new();
        let before = store.activation_generation();
        draft(&store, "p1");
        store.approve("p1", "1.0.0", "reviewer").unwrap();
        store.deploy("p1", "1.0.0", "ops").unwrap();
        assert!(store.activation_generation() > before);
    }

    #[test]
    fn test_change_log_filters() {
        let store = PolicyVersionStore::new();
        let since = Utc::now() - chrono::Duration::minutes(1);
        draft(&store, "p1");
        draft(&store, "p2");

        let changes = store.changes_since(&["p1".to_string()], since);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].policy_id, "p1");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");
        let snapshot = store.snapshot("p1");

        store.delete_policy("p1", "ops").unwrap();
        assert!(!store.exists("p1"));

        store.restore_snapshot("p1", snapshot);
        assert!(store.exists("p1"));
        assert_eq!(store.get_latest("p1").unwrap().version, "1.0.0");
    }

    #[test]
    fn test_duplicate_creation_conflicts() {
        let store = PolicyVersionStore::new();
        draft(&store, "p1");
        let metadata = PolicyMetadata {
            change_type: Some(ChangeType::Creation),
            ..Default::default()
        };
        let err = store
            .create_version("p1", simple_content(), metadata, "author")
            .unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }
}
