//! External KMS capability used by C7 to wrap/unwrap revision-key DEKs.
//!
//! A small abstract interface, per the design notes: the KMS is a
//! capability (`wrap`, `unwrap`) rather than a concrete client type, so
//! rotation logic stays testable without a real key-management backend.

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("wrap failed: {0}")]
    WrapFailed(String),
    #[error("unwrap failed: {0}")]
    UnwrapFailed(String),
}

#[async_trait]
pub trait Kms: Send + Sync {
    /// Wraps a raw data-encryption key under the configured master key.
    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KmsError>;
    /// Unwraps a previously wrapped data-encryption key.
    async fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError>;
}

/// An envelope-encryption KMS stand-in: wraps DEKs with a local master key
/// via AES-256-GCM. Production deployments swap this for a real cloud KMS
/// client implementing the same trait; the rotation and token logic never
/// need to know the difference.
pub struct LocalEnvelopeKms {
    master_key: [u8; 32],
}

impl LocalEnvelopeKms {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    pub fn from_key_id(key_id: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(key_id.as_bytes());
        let digest = hasher.finalize();
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&digest);
        Self::new(master_key)
    }
}

#[async_trait]
impl Kms for LocalEnvelopeKms {
    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KmsError> {
        use aes_gcm::{
            aead::{Aead, KeyInit, Payload},
            Aes256Gcm, Nonce,
        };
        use rand::{rngs::OsRng, RngCore};

        let cipher = Aes256Gcm::new_from_slice(&self.master_key)
            .map_err(|e| KmsError::WrapFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: dek, aad: b"" })
            .map_err(|e| KmsError::WrapFailed(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(12 + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    async fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        use aes_gcm::{
            aead::{Aead, KeyInit, Payload},
            Aes256Gcm, Nonce,
        };

        if wrapped.len() < 12 {
            return Err(KmsError::UnwrapFailed("wrapped key too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(12);

        let cipher = Aes256Gcm::new_from_slice(&self.master_key)
            .map_err(|e| KmsError::UnwrapFailed(e.to_string()))?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad: b"" })
            .map_err(|_| KmsError::UnwrapFailed("authentication failed".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wrap_then_unwrap_round_trips() {
        let kms = LocalEnvelopeKms::from_key_id("test-key");
        let dek = vec![7u8; 32];

        let wrapped = kms.wrap(&dek).await.unwrap();
        let unwrapped = kms.unwrap(&wrapped).await.unwrap();

        assert_eq!(&*unwrapped, &dek);
    }

    #[tokio::test]
    async fn tampered_wrapped_key_fails_unwrap() {
        let kms = LocalEnvelopeKms::from_key_id("test-key");
        let dek = vec![7u8; 32];
        let mut wrapped = kms.wrap(&dek).await.unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xFF;

        assert!(kms.unwrap(&wrapped).await.is_err());
    }
}
