// # Key Manager
//
// Owns key identity and confidentiality of material at rest. Keys live one
// per file, sealed under the master key; plaintext material is cached in a
// bounded LRU. Rotation and revocation take a per-key lock; retrieval is
// lock-free on a cache hit.

use crate::audit::{AuditAction, AuditLedger, AuditMeta, AuditResult};
use crate::consent::ConsentRegistry;
use crate::error::{Result, VaultError};
use crate::keys::seal::{seal_material, unseal_material, SealedMaterial};
use crate::keys::{EncryptionKey, KeyAlgorithm, KeyId, KeyPurpose, KeyStatus, SealedKeyFile};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Key manager configuration.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Directory of key files, one per key, mode 0600.
    pub data_dir: PathBuf,
    /// Directory of timestamped backup bundles.
    pub backup_dir: PathBuf,
    /// Sealing algorithm for key files.
    pub algorithm: KeyAlgorithm,
    /// Lifetime assigned to new keys.
    pub default_lifetime: Duration,
    /// How long a rotated predecessor can still decrypt.
    pub rotation_grace: Duration,
    /// Plaintext cache capacity.
    pub cache_capacity: usize,
    /// Auto-rotate keys past this fraction of their lifetime.
    pub auto_rotate: bool,
    /// Backup bundles older than this are purged by maintenance.
    pub backup_retention_days: i64,
    /// Seal the backup bundle itself under the master key.
    pub encrypt_backups: bool,
}

impl KeyManagerConfig {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref().to_path_buf();
        Self {
            data_dir: base.join("keys"),
            backup_dir: base.join("key_backups"),
            algorithm: KeyAlgorithm::Aes256Gcm,
            default_lifetime: Duration::days(365),
            rotation_grace: Duration::days(30),
            cache_capacity: 128,
            auto_rotate: true,
            backup_retention_days: 90,
            encrypt_backups: true,
        }
    }
}

/// Summary returned by `maintenance`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub auto_rotated: usize,
    pub backups_purged: usize,
}

/// Key store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStoreStats {
    pub total: usize,
    pub active: usize,
    pub rotated: usize,
    pub revoked: usize,
    pub expired: usize,
}

/// Backup bundle: sealed key files plus a payload signature.
#[derive(Debug, Serialize, Deserialize)]
struct BackupBundle {
    created_at: DateTime<Utc>,
    keys: Vec<SealedKeyFile>,
    /// SHA-256 hex of the serialized key list.
    signature: String,
    /// Present when the key list is itself sealed under the master key.
    sealed_nonce_b64: Option<String>,
}

// Bounded plaintext cache, least-recently-used eviction
struct MaterialCache {
    capacity: usize,
    map: HashMap<KeyId, Vec<u8>>,
    order: VecDeque<KeyId>,
}

impl MaterialCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key_id: &str) -> Option<Vec<u8>> {
        if let Some(material) = self.map.get(key_id).cloned() {
            self.touch(key_id);
            Some(material)
        } else {
            None
        }
    }

    fn put(&mut self, key_id: KeyId, material: Vec<u8>) {
        if self.map.contains_key(&key_id) {
            self.map.insert(key_id.clone(), material);
            self.touch(&key_id);
            return;
        }
        while self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            } else {
                break;
            }
        }
        self.order.push_back(key_id.clone());
        self.map.insert(key_id, material);
    }

    fn remove(&mut self, key_id: &str) {
        self.map.remove(key_id);
        self.order.retain(|id| id != key_id);
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn touch(&mut self, key_id: &str) {
        self.order.retain(|id| id != key_id);
        self.order.push_back(key_id.to_string());
    }
}

/// The key manager.
pub struct KeyManager {
    config: KeyManagerConfig,
    master_key: Vec<u8>,
    keys: RwLock<HashMap<KeyId, EncryptionKey>>,
    cache: Mutex<MaterialCache>,
    // Per-key serialization of rotation and revocation
    key_locks: DashMap<KeyId, Arc<Mutex<()>>>,
    consent: Option<Arc<ConsentRegistry>>,
    audit: RwLock<Option<Arc<AuditLedger>>>,
}

impl KeyManager {
    /// Open a key manager, loading any existing key files.
    pub fn new(config: KeyManagerConfig, master_key: Vec<u8>) -> Result<Self> {
        if master_key.len() != config.algorithm.key_size() {
            return Err(VaultError::InvalidInput(format!(
                "master key must be {} bytes",
                config.algorithm.key_size()
            )));
        }
        fs::create_dir_all(&config.data_dir)
            .map_err(|e| VaultError::Storage(format!("create key dir: {}", e)))?;
        fs::create_dir_all(&config.backup_dir)
            .map_err(|e| VaultError::Storage(format!("create backup dir: {}", e)))?;

        let cache_capacity = config.cache_capacity;
        let manager = Self {
            config,
            master_key,
            keys: RwLock::new(HashMap::new()),
            cache: Mutex::new(MaterialCache::new(cache_capacity)),
            key_locks: DashMap::new(),
            consent: None,
            audit: RwLock::new(None),
        };
        manager.load_key_files()?;
        Ok(manager)
    }

    /// Attach the consent registry used for community key custody checks.
    pub fn with_consent(mut self, consent: Arc<ConsentRegistry>) -> Self {
        self.consent = Some(consent);
        self
    }

    /// Attach the audit ledger. Set once at composition time.
    pub fn set_audit(&self, audit: Arc<AuditLedger>) {
        *self.audit.write() = Some(audit);
    }

    /// Generate and persist a new key.
    ///
    /// A community-scoped key requires recorded custody consent for the
    /// community.
    pub fn generate(
        &self,
        purpose: KeyPurpose,
        classification: &str,
        community_id: Option<&str>,
    ) -> Result<EncryptionKey> {
        if community_id.is_some() && purpose != KeyPurpose::Community {
            return Err(VaultError::InvalidInput(
                "community id is only valid for community keys".to_string(),
            ));
        }
        if let Some(community) = community_id {
            let consented = self
                .consent
                .as_ref()
                .map(|registry| registry.community_key_custody(community))
                .unwrap_or(false);
            if !consented {
                return Err(VaultError::ConsentInsufficient(format!(
                    "community '{}' has not consented to key custody",
                    community
                )));
            }
        }

        let now = Utc::now();
        let mut material = vec![0u8; self.config.algorithm.key_size()];
        rand::rng().fill_bytes(&mut material);
        let mut salt = vec![0u8; 16];
        rand::rng().fill_bytes(&mut salt);

        let key = EncryptionKey {
            id: Uuid::new_v4().to_string(),
            algorithm: self.config.algorithm,
            material,
            salt,
            created_at: now,
            rotated_at: None,
            expires_at: Some(now + self.config.default_lifetime),
            classification: classification.to_string(),
            purpose,
            community_id: community_id.map(str::to_string),
            status: KeyStatus::Active,
        };

        self.persist_key(&key)?;
        self.cache.lock().put(key.id.clone(), key.material.clone());
        self.keys.write().insert(key.id.clone(), key.clone());

        self.audit_key_event(AuditAction::GenerateKey, &key.id, AuditResult::Success);
        tracing::info!(key_id = %key.id, purpose = ?purpose, "key generated");
        Ok(key)
    }

    /// Retrieve a usable key: active, or rotated within the grace window.
    /// Revoked and expired keys are never returned.
    pub fn get(&self, key_id: &str) -> Result<EncryptionKey> {
        let metadata = self
            .keys
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("key {}", key_id)))?;

        let now = Utc::now();
        if !metadata.usable_at(now, self.config.rotation_grace) {
            return Err(VaultError::PreconditionFailed(format!(
                "key {} is {:?}",
                key_id, metadata.status
            )));
        }

        let mut key = metadata;
        let cached = self.cache.lock().get(key_id);
        if let Some(material) = cached {
            key.material = material;
        } else {
            key.material = self.unseal_from_file(key_id)?;
            self.cache.lock().put(key_id.to_string(), key.material.clone());
        }

        self.audit_key_event(AuditAction::RetrieveKey, key_id, AuditResult::Success);
        Ok(key)
    }

    /// List key metadata, filtering out revoked and expired keys.
    pub fn list(&self, purpose: Option<KeyPurpose>) -> Vec<EncryptionKey> {
        let now = Utc::now();
        self.keys
            .read()
            .values()
            .filter(|key| key.usable_at(now, self.config.rotation_grace))
            .filter(|key| purpose.map(|p| key.purpose == p).unwrap_or(true))
            .map(EncryptionKey::redacted)
            .collect()
    }

    /// Rotate a key: the successor inherits purpose, classification, and
    /// community; the predecessor keeps decrypting for the grace window.
    pub fn rotate(&self, key_id: &str) -> Result<EncryptionKey> {
        let lock = self.lock_for(key_id);
        let _guard = lock.lock();

        let predecessor = self
            .keys
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("key {}", key_id)))?;
        if predecessor.status != KeyStatus::Active {
            return Err(VaultError::PreconditionFailed(format!(
                "only active keys rotate, key {} is {:?}",
                key_id, predecessor.status
            )));
        }

        let now = Utc::now();
        let mut material = vec![0u8; self.config.algorithm.key_size()];
        rand::rng().fill_bytes(&mut material);
        let mut salt = vec![0u8; 16];
        rand::rng().fill_bytes(&mut salt);

        let successor = EncryptionKey {
            id: Uuid::new_v4().to_string(),
            algorithm: predecessor.algorithm,
            material,
            salt,
            created_at: now,
            rotated_at: None,
            expires_at: Some(now + self.config.default_lifetime),
            classification: predecessor.classification.clone(),
            purpose: predecessor.purpose,
            community_id: predecessor.community_id.clone(),
            status: KeyStatus::Active,
        };

        let mut retired = predecessor;
        retired.status = KeyStatus::Rotated;
        retired.rotated_at = Some(now);
        retired.material = Vec::new();

        self.persist_key(&successor)?;
        self.persist_metadata(&retired)?;

        {
            let mut keys = self.keys.write();
            keys.insert(retired.id.clone(), retired);
            keys.insert(successor.id.clone(), successor.clone());
        }
        self.cache
            .lock()
            .put(successor.id.clone(), successor.material.clone());

        self.audit_key_event(AuditAction::RotateKey, key_id, AuditResult::Success);
        tracing::info!(old = %key_id, new = %successor.id, "key rotated");
        Ok(successor)
    }

    /// Revoke a key. Subsequent retrievals fail.
    pub fn revoke(&self, key_id: &str, reason: &str) -> Result<()> {
        let lock = self.lock_for(key_id);
        let _guard = lock.lock();

        let mut keys = self.keys.write();
        let key = keys
            .get_mut(key_id)
            .ok_or_else(|| VaultError::NotFound(format!("key {}", key_id)))?;
        key.status = KeyStatus::Revoked;
        let snapshot = key.redacted();
        drop(keys);

        self.persist_metadata(&snapshot)?;
        self.cache.lock().remove(key_id);

        self.audit_key_event(AuditAction::RevokeKey, key_id, AuditResult::Success);
        tracing::warn!(key_id = %key_id, reason = %reason, "key revoked");
        Ok(())
    }

    /// Emit a backup bundle of every stored key file with a signature over
    /// the payload. When backup encryption is enabled the payload is sealed
    /// under the master key.
    pub fn backup(&self) -> Result<Vec<u8>> {
        let files = self.read_all_key_files()?;
        let payload = serde_json::to_vec(&files)?;
        let signature = hex::encode(Sha256::digest(&payload));

        let bundle = if self.config.encrypt_backups {
            let sealed = seal_material(
                &self.master_key,
                "key-backup-bundle",
                &payload,
                self.config.algorithm,
            )?;
            BackupBundle {
                created_at: Utc::now(),
                keys: Vec::new(),
                signature: hex::encode(Sha256::digest(&sealed.ciphertext)),
                sealed_nonce_b64: Some(format!(
                    "{}:{}",
                    BASE64.encode(&sealed.nonce),
                    BASE64.encode(&sealed.ciphertext)
                )),
            }
        } else {
            BackupBundle {
                created_at: Utc::now(),
                keys: files,
                signature,
                sealed_nonce_b64: None,
            }
        };

        let encoded = bincode::serde::encode_to_vec(&bundle, bincode::config::standard())
            .map_err(|e| VaultError::Serialization(format!("encode backup: {}", e)))?;

        let name = format!("backup_{}.bin", Utc::now().format("%Y%m%d_%H%M%S%3f"));
        let path = self.config.backup_dir.join(name);
        fs::write(&path, &encoded)
            .map_err(|e| VaultError::Storage(format!("write backup: {}", e)))?;

        self.audit_key_event(AuditAction::BackupKeys, "key-store", AuditResult::Success);
        Ok(encoded)
    }

    /// Restore keys from a backup bundle. Verifies the signature, decrypts
    /// if sealed, rewrites key files, and clears the plaintext cache.
    pub fn restore(&self, bundle_bytes: &[u8]) -> Result<usize> {
        let (bundle, _): (BackupBundle, usize) =
            bincode::serde::decode_from_slice(bundle_bytes, bincode::config::standard())
                .map_err(|e| VaultError::Serialization(format!("decode backup: {}", e)))?;

        let files: Vec<SealedKeyFile> = match bundle.sealed_nonce_b64 {
            Some(ref packed) => {
                let (nonce_b64, ciphertext_b64) = packed.split_once(':').ok_or_else(|| {
                    VaultError::Integrity("backup bundle framing invalid".to_string())
                })?;
                let sealed = SealedMaterial {
                    nonce: BASE64
                        .decode(nonce_b64)
                        .map_err(|e| VaultError::Integrity(format!("backup nonce: {}", e)))?,
                    ciphertext: BASE64
                        .decode(ciphertext_b64)
                        .map_err(|e| VaultError::Integrity(format!("backup body: {}", e)))?,
                };
                if hex::encode(Sha256::digest(&sealed.ciphertext)) != bundle.signature {
                    return Err(VaultError::Integrity(
                        "backup signature mismatch".to_string(),
                    ));
                }
                let payload = unseal_material(
                    &self.master_key,
                    "key-backup-bundle",
                    &sealed,
                    self.config.algorithm,
                )?;
                serde_json::from_slice(&payload)?
            }
            None => {
                let payload = serde_json::to_vec(&bundle.keys)?;
                if hex::encode(Sha256::digest(&payload)) != bundle.signature {
                    return Err(VaultError::Integrity(
                        "backup signature mismatch".to_string(),
                    ));
                }
                bundle.keys
            }
        };

        let restored = files.len();
        for file in &files {
            self.write_key_file(file)?;
        }
        self.cache.lock().clear();
        self.load_key_files()?;

        self.audit_key_event(AuditAction::RestoreKeys, "key-store", AuditResult::Success);
        Ok(restored)
    }

    /// Expire overdue keys, auto-rotate keys near end of life, and purge old
    /// backups.
    pub fn maintenance(&self) -> Result<MaintenanceReport> {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        let snapshot: Vec<EncryptionKey> =
            self.keys.read().values().map(EncryptionKey::redacted).collect();

        for key in snapshot {
            match key.status {
                KeyStatus::Active => {
                    if let Some(expiry) = key.expires_at {
                        if expiry < now {
                            let mut keys = self.keys.write();
                            if let Some(stored) = keys.get_mut(&key.id) {
                                stored.status = KeyStatus::Expired;
                                let snapshot = stored.redacted();
                                drop(keys);
                                self.persist_metadata(&snapshot)?;
                                self.cache.lock().remove(&key.id);
                                report.expired += 1;
                            }
                            continue;
                        }
                        if self.config.auto_rotate {
                            let lifetime = expiry - key.created_at;
                            let elapsed = now - key.created_at;
                            // Rotate past 90% of lifetime
                            if elapsed.num_seconds() * 10 >= lifetime.num_seconds() * 9 {
                                self.rotate(&key.id)?;
                                report.auto_rotated += 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        report.backups_purged = self.purge_old_backups(now)?;
        Ok(report)
    }

    pub fn stats(&self) -> KeyStoreStats {
        let keys = self.keys.read();
        let mut stats = KeyStoreStats {
            total: keys.len(),
            active: 0,
            rotated: 0,
            revoked: 0,
            expired: 0,
        };
        for key in keys.values() {
            match key.status {
                KeyStatus::Active => stats.active += 1,
                KeyStatus::Rotated => stats.rotated += 1,
                KeyStatus::Revoked => stats.revoked += 1,
                KeyStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    fn lock_for(&self, key_id: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn key_file_path(&self, key_id: &str) -> PathBuf {
        self.config.data_dir.join(format!("{}.json", key_id))
    }

    fn persist_key(&self, key: &EncryptionKey) -> Result<()> {
        let sealed = seal_material(&self.master_key, &key.id, &key.material, key.algorithm)?;
        let file = SealedKeyFile {
            id: key.id.clone(),
            algorithm: key.algorithm,
            nonce_b64: BASE64.encode(&sealed.nonce),
            ciphertext_b64: BASE64.encode(&sealed.ciphertext),
            salt_b64: BASE64.encode(&key.salt),
            created_at: key.created_at,
            rotated_at: key.rotated_at,
            expires_at: key.expires_at,
            classification: key.classification.clone(),
            purpose: key.purpose,
            community_id: key.community_id.clone(),
            status: key.status,
        };
        self.write_key_file(&file)
    }

    /// Rewrite a key file's metadata, preserving its sealed material.
    fn persist_metadata(&self, key: &EncryptionKey) -> Result<()> {
        let path = self.key_file_path(&key.id);
        let raw = fs::read_to_string(&path)
            .map_err(|e| VaultError::Storage(format!("read key file: {}", e)))?;
        let mut file: SealedKeyFile = serde_json::from_str(&raw)?;
        file.status = key.status;
        file.rotated_at = key.rotated_at;
        file.expires_at = key.expires_at;
        self.write_key_file(&file)
    }

    fn write_key_file(&self, file: &SealedKeyFile) -> Result<()> {
        let path = self.key_file_path(&file.id);
        let json = serde_json::to_string_pretty(file)?;
        fs::write(&path, json)
            .map_err(|e| VaultError::Storage(format!("write key file: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .map_err(|e| VaultError::Storage(format!("chmod key file: {}", e)))?;
        }
        Ok(())
    }

    fn unseal_from_file(&self, key_id: &str) -> Result<Vec<u8>> {
        let path = self.key_file_path(key_id);
        let raw = fs::read_to_string(&path)
            .map_err(|e| VaultError::Storage(format!("read key file: {}", e)))?;
        let file: SealedKeyFile = serde_json::from_str(&raw)?;
        let sealed = SealedMaterial {
            nonce: BASE64
                .decode(&file.nonce_b64)
                .map_err(|e| VaultError::Integrity(format!("key nonce: {}", e)))?,
            ciphertext: BASE64
                .decode(&file.ciphertext_b64)
                .map_err(|e| VaultError::Integrity(format!("key body: {}", e)))?,
        };
        unseal_material(&self.master_key, key_id, &sealed, file.algorithm)
    }

    fn read_all_key_files(&self) -> Result<Vec<SealedKeyFile>> {
        let mut files: Vec<SealedKeyFile> = Vec::new();
        let entries = fs::read_dir(&self.config.data_dir)
            .map_err(|e| VaultError::Storage(format!("read key dir: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::Storage(format!("read key dir: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .map_err(|e| VaultError::Storage(format!("read key file: {}", e)))?;
            files.push(serde_json::from_str(&raw)?);
        }
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    fn load_key_files(&self) -> Result<()> {
        let files = self.read_all_key_files()?;
        let mut keys = self.keys.write();
        keys.clear();
        for file in files {
            keys.insert(
                file.id.clone(),
                EncryptionKey {
                    id: file.id.clone(),
                    algorithm: file.algorithm,
                    material: Vec::new(),
                    salt: BASE64.decode(&file.salt_b64).unwrap_or_default(),
                    created_at: file.created_at,
                    rotated_at: file.rotated_at,
                    expires_at: file.expires_at,
                    classification: file.classification.clone(),
                    purpose: file.purpose,
                    community_id: file.community_id.clone(),
                    status: file.status,
                },
            );
        }
        Ok(())
    }

    fn purge_old_backups(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(self.config.backup_retention_days);
        let mut purged = 0;
        let entries = fs::read_dir(&self.config.backup_dir)
            .map_err(|e| VaultError::Storage(format!("read backup dir: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::Storage(format!("read backup dir: {}", e)))?;
            let metadata = entry
                .metadata()
                .map_err(|e| VaultError::Storage(format!("backup metadata: {}", e)))?;
            let modified: DateTime<Utc> = metadata
                .modified()
                .map_err(|e| VaultError::Storage(format!("backup mtime: {}", e)))?
                .into();
            if modified < cutoff {
                fs::remove_file(entry.path())
                    .map_err(|e| VaultError::Storage(format!("remove backup: {}", e)))?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn audit_key_event(&self, action: AuditAction, target: &str, result: AuditResult) {
        if let Some(ref ledger) = *self.audit.read() {
            let _ = ledger.record(
                "key-manager",
                action,
                target,
                serde_json::json!({}),
                result,
                AuditMeta::default(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{ConsentLevel, ConsentMethod};

    fn manager() -> (tempfile::TempDir, KeyManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyManagerConfig::new(dir.path());
        let manager = KeyManager::new(config, vec![9u8; 32]).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_generate_and_get() {
        let (_dir, manager) = manager();
        let key = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();
        assert_eq!(key.material.len(), 32);

        let fetched = manager.get(&key.id).unwrap();
        assert_eq!(fetched.material, key.material);
    }

    #[test]
    fn test_get_survives_cache_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KeyManagerConfig::new(dir.path());
        config.cache_capacity = 1;
        let manager = KeyManager::new(config, vec![9u8; 32]).unwrap();

        let first = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();
        let _second = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();

        // First key's material was evicted and must come back from its file.
        let fetched = manager.get(&first.id).unwrap();
        assert_eq!(fetched.material, first.material);
    }

    #[test]
    fn test_rotation_keeps_grace_window() {
        let (_dir, manager) = manager();
        let original = manager
            .generate(KeyPurpose::Tokenization, "confidential", None)
            .unwrap();
        let successor = manager.rotate(&original.id).unwrap();
        assert_ne!(original.id, successor.id);
        assert_eq!(successor.purpose, KeyPurpose::Tokenization);

        // Predecessor still decryptable during the grace window
        let old = manager.get(&original.id).unwrap();
        assert_eq!(old.status, KeyStatus::Rotated);
        assert_eq!(old.material, original.material);
    }

    #[test]
    fn test_revoked_key_unretrievable() {
        let (_dir, manager) = manager();
        let key = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();
        manager.revoke(&key.id, "compromise suspected").unwrap();

        let err = manager.get(&key.id).unwrap_err();
        assert!(matches!(err, VaultError::PreconditionFailed(_)));
        assert!(manager.list(None).is_empty());
    }

    #[test]
    fn test_community_key_requires_consent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ConsentRegistry::new());
        let manager = KeyManager::new(KeyManagerConfig::new(dir.path()), vec![9u8; 32])
            .unwrap()
            .with_consent(registry.clone());

        let err = manager
            .generate(KeyPurpose::Community, "sacred", Some("community-1"))
            .unwrap_err();
        assert!(matches!(err, VaultError::ConsentInsufficient(_)));

        registry.grant(
            "community-1",
            "key_custody",
            ConsentLevel::FullAutomation,
            ConsentMethod::TraditionalOwnerAuthority,
            None,
        );
        let key = manager
            .generate(KeyPurpose::Community, "sacred", Some("community-1"))
            .unwrap();
        assert_eq!(key.community_id.as_deref(), Some("community-1"));
    }

    #[test]
    fn test_backup_restore_round_trip() {
        let (_dir, manager) = manager();
        let key = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();

        let bundle = manager.backup().unwrap();

        // Lose the in-memory state, then restore
        manager.keys.write().clear();
        manager.cache.lock().clear();
        std::fs::remove_file(manager.key_file_path(&key.id)).unwrap();

        let restored = manager.restore(&bundle).unwrap();
        assert_eq!(restored, 1);
        let fetched = manager.get(&key.id).unwrap();
        assert_eq!(fetched.material, key.material);
    }

    #[test]
    fn test_tampered_backup_rejected() {
        let (_dir, manager) = manager();
        manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();
        let mut bundle = manager.backup().unwrap();
        let last = bundle.len() - 1;
        bundle[last] ^= 0x01;
        assert!(manager.restore(&bundle).is_err());
    }

    #[test]
    fn test_maintenance_expires_overdue_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KeyManagerConfig::new(dir.path());
        config.auto_rotate = false;
        let manager = KeyManager::new(config, vec![9u8; 32]).unwrap();

        let key = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();
        manager.keys.write().get_mut(&key.id).unwrap().expires_at =
            Some(Utc::now() - Duration::hours(1));

        let report = manager.maintenance().unwrap();
        assert_eq!(report.expired, 1);
        assert!(manager.get(&key.id).is_err());
    }

    #[test]
    fn test_stats() {
        let (_dir, manager) = manager();
        let a = manager
            .generate(KeyPurpose::DataAtRest, "confidential", None)
            .unwrap();
        manager
            .generate(KeyPurpose::Tokenization, "confidential", None)
            .unwrap();
        manager.rotate(&a.id).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.rotated, 1);
    }
}
