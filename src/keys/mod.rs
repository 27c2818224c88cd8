// # Key Manager Module
//
// Symmetric key lifecycle for the vault: generation, sealed storage under a
// master key, rotation with a decryption grace window, revocation, backup
// bundles, and scheduled maintenance.
//
// ## Key Hierarchy
//
// ```text
// ┌─────────────────────────────────────────┐
// │  Master Key                             │
// │  - Supplied by the operator             │
// │  - Seals every managed key at rest      │
// └──────────────┬──────────────────────────┘
//                │ Seals (AEAD, key id as AAD)
//                ▼
// ┌─────────────────────────────────────────┐
// │  Managed Keys                           │
// │  - audit_integrity / data_at_rest /     │
// │    tokenization / community             │
// │  - One file per key, mode 0600          │
// └─────────────────────────────────────────┘
// ```

pub mod manager;
pub mod seal;

pub use manager::{KeyManager, KeyManagerConfig, KeyStoreStats, MaintenanceReport};
pub use seal::{seal_material, unseal_material, SealedMaterial};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key identifier.
pub type KeyId = String;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl KeyAlgorithm {
    /// Key material size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            KeyAlgorithm::Aes256Gcm => 32,
            KeyAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Nonce size in bytes.
    pub fn nonce_size(&self) -> usize {
        12
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Aes256Gcm => "AES256GCM",
            KeyAlgorithm::ChaCha20Poly1305 => "CHACHA20POLY1305",
        }
    }
}

/// What a key is for. Community keys are scoped to a community id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    AuditIntegrity,
    DataAtRest,
    Tokenization,
    Community,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Rotated,
    Revoked,
    Expired,
}

/// A managed symmetric key.
///
/// `material` is plaintext and never serialized; the sealed form lives in
/// the key file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub id: KeyId,
    pub algorithm: KeyAlgorithm,
    #[serde(skip)]
    pub material: Vec<u8>,
    pub salt: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub classification: String,
    pub purpose: KeyPurpose,
    pub community_id: Option<String>,
    pub status: KeyStatus,
}

impl EncryptionKey {
    /// Whether the key can decrypt at `now`: active, or rotated within the
    /// grace window.
    pub fn usable_at(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match self.status {
            KeyStatus::Active => self
                .expires_at
                .map(|expiry| now < expiry)
                .unwrap_or(true),
            KeyStatus::Rotated => self
                .rotated_at
                .map(|rotated| now < rotated + grace)
                .unwrap_or(false),
            KeyStatus::Revoked | KeyStatus::Expired => false,
        }
    }

    /// Metadata-only copy, with the material stripped.
    pub fn redacted(&self) -> EncryptionKey {
        let mut copy = self.clone();
        copy.material = Vec::new();
        copy
    }
}

/// Persisted key file contents: sealed material plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKeyFile {
    pub id: KeyId,
    pub algorithm: KeyAlgorithm,
    pub nonce_b64: String,
    pub ciphertext_b64: String,
    pub salt_b64: String,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub classification: String,
    pub purpose: KeyPurpose,
    pub community_id: Option<String>,
    pub status: KeyStatus,
}
