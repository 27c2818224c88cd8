// # Key Sealing
//
// AEAD sealing of key material under the master key. The key id is bound as
// associated data, so a sealed blob moved to another key file fails
// authentication. The nonce is generated per seal and stored beside the
// ciphertext; the tag lives at the end of the ciphertext as the AEAD crates
// emit it.

use crate::error::{Result, VaultError};
use crate::keys::KeyAlgorithm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

/// Sealed material: nonce plus ciphertext-with-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMaterial {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` under `master_key`, binding `key_id` as associated data.
pub fn seal_material(
    master_key: &[u8],
    key_id: &str,
    plaintext: &[u8],
    algorithm: KeyAlgorithm,
) -> Result<SealedMaterial> {
    if master_key.len() != algorithm.key_size() {
        return Err(VaultError::Crypto(format!(
            "master key must be {} bytes for {}",
            algorithm.key_size(),
            algorithm.as_str()
        )));
    }

    let mut nonce = vec![0u8; algorithm.nonce_size()];
    rand::rng().fill_bytes(&mut nonce);

    let payload = Payload {
        msg: plaintext,
        aad: key_id.as_bytes(),
    };

    let ciphertext = match algorithm {
        KeyAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(master_key)
                .map_err(|e| VaultError::Crypto(format!("cipher init: {}", e)))?;
            cipher
                .encrypt(Nonce::from_slice(&nonce), payload)
                .map_err(|e| VaultError::Crypto(format!("seal failed: {}", e)))?
        }
        KeyAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(master_key)
                .map_err(|e| VaultError::Crypto(format!("cipher init: {}", e)))?;
            cipher
                .encrypt(
                    chacha20poly1305::Nonce::from_slice(&nonce),
                    payload,
                )
                .map_err(|e| VaultError::Crypto(format!("seal failed: {}", e)))?
        }
    };

    Ok(SealedMaterial { nonce, ciphertext })
}

/// Unseal material. Any mismatch in nonce, ciphertext, tag, or associated
/// data fails with an integrity error, never recovered.
pub fn unseal_material(
    master_key: &[u8],
    key_id: &str,
    sealed: &SealedMaterial,
    algorithm: KeyAlgorithm,
) -> Result<Vec<u8>> {
    if master_key.len() != algorithm.key_size() {
        return Err(VaultError::Crypto(format!(
            "master key must be {} bytes for {}",
            algorithm.key_size(),
            algorithm.as_str()
        )));
    }
    if sealed.nonce.len() != algorithm.nonce_size() {
        return Err(VaultError::Integrity(format!(
            "key '{}' has malformed nonce",
            key_id
        )));
    }

    let payload = Payload {
        msg: sealed.ciphertext.as_slice(),
        aad: key_id.as_bytes(),
    };

    let plaintext = match algorithm {
        KeyAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(master_key)
                .map_err(|e| VaultError::Crypto(format!("cipher init: {}", e)))?;
            cipher.decrypt(Nonce::from_slice(&sealed.nonce), payload)
        }
        KeyAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(master_key)
                .map_err(|e| VaultError::Crypto(format!("cipher init: {}", e)))?;
            cipher.decrypt(
                chacha20poly1305::Nonce::from_slice(&sealed.nonce),
                payload,
            )
        }
    };

    plaintext.map_err(|_| {
        VaultError::Integrity(format!("key '{}' failed authentication on unseal", key_id))
    })
}
