//! C8 — Revision Token Manager.
//!
//! Process-wide singleton caching unwrapped revision-key DEKs behind a
//! reader-writer lock, per the concurrency model's "only long-lived
//! in-memory mutable state" rule. Grounded on the AES-256-GCM usage
//! pattern in this crate's crypto layer: nonce-prefixed ciphertext, AAD
//! passed straight through to the cipher.

use std::collections::HashMap;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::kms::Kms;
use crate::repository::RepoResult;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unknown key")]
    UnknownKey,
    #[error("tampered: authentication failed")]
    Tampered,
    #[error("no effective revision key available")]
    NoEffectiveKey,
    #[error(transparent)]
    Kms(#[from] crate::kms::KmsError),
    #[error(transparent)]
    Repository(#[from] crate::repository::RepositoryError),
}

pub type TokenResult<T> = Result<T, TokenError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyTriple {
    pub key_bytes: Vec<u8>,
    pub interval_number: i64,
    pub interval_count: i32,
}

struct CachedKey {
    dek: Zeroizing<Vec<u8>>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

struct Cache {
    effective_id: Option<Uuid>,
    allowed: HashMap<Uuid, CachedKey>,
    refresh_after: DateTime<Utc>,
}

impl Cache {
    fn empty() -> Self {
        Self { effective_id: None, allowed: HashMap::new(), refresh_after: DateTime::<Utc>::MIN_UTC }
    }
}

/// Minimal view the repository exposes for a cheap "what's currently
/// allowed" check that does not touch the KMS.
#[async_trait::async_trait]
pub trait RevisionKeyLookup: Send + Sync {
    async fn allowed_key_ids(&self) -> RepoResult<Vec<Uuid>>;
    async fn effective_key_id(&self) -> RepoResult<Option<Uuid>>;
    async fn load_allowed_keys(&self) -> RepoResult<Vec<crate::model::RevisionKey>>;
}

pub struct RevisionTokenManager {
    cache: RwLock<Cache>,
    cache_duration: Duration,
    kms: std::sync::Arc<dyn Kms>,
    lookup: std::sync::Arc<dyn RevisionKeyLookup>,
}

impl RevisionTokenManager {
    pub fn new(
        kms: std::sync::Arc<dyn Kms>,
        lookup: std::sync::Arc<dyn RevisionKeyLookup>,
        cache_duration: Duration,
    ) -> Self {
        Self { cache: RwLock::new(Cache::empty()), cache_duration, kms, lookup }
    }

    /// Refreshes the cache if stale. Cheap path: if the effective id is
    /// unchanged and every allowed id is already cached, just bump the
    /// refresh deadline without touching the KMS.
    async fn ensure_fresh(&self) -> TokenResult<()> {
        let now = Utc::now();
        {
            let cache = self.cache.read().await;
            if now <= cache.refresh_after {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().await;
        if now <= cache.refresh_after {
            return Ok(());
        }

        let current_effective = self.lookup.effective_key_id().await?;
        let current_allowed = self.lookup.allowed_key_ids().await?;

        let cheap_hit = current_effective == cache.effective_id
            && current_allowed.iter().all(|id| cache.allowed.contains_key(id));

        if cheap_hit {
            cache.refresh_after = now + chrono::Duration::from_std(self.cache_duration).unwrap_or_default();
            return Ok(());
        }

        let keys = self.lookup.load_allowed_keys().await?;
        let mut allowed = HashMap::new();
        for key in &keys {
            let dek = self.kms.unwrap(&key.wrapped_dek).await?;
            allowed.insert(key.id, CachedKey { dek, created_at: key.created_at });
        }

        cache.effective_id = current_effective;
        cache.allowed = allowed;
        cache.refresh_after = now + chrono::Duration::from_std(self.cache_duration).unwrap_or_default();

        Ok(())
    }

    /// Sorts keys by their base64 representation for a deterministic
    /// canonical order, then AES-GCM encrypts under the effective DEK.
    pub async fn make_token(&self, keys: &[KeyTriple], aad: &[u8]) -> TokenResult<Vec<u8>> {
        self.ensure_fresh().await?;

        let cache = self.cache.read().await;
        let effective_id = cache.effective_id.ok_or(TokenError::NoEffectiveKey)?;
        let cached = cache.allowed.get(&effective_id).ok_or(TokenError::NoEffectiveKey)?;

        use base64::Engine;
        let mut sorted = keys.to_vec();
        sorted.sort_by_key(|k| base64::engine::general_purpose::STANDARD.encode(&k.key_bytes));

        let plaintext = serde_json::to_vec(&sorted).map_err(|_| TokenError::NoEffectiveKey)?;

        let cipher = Aes256Gcm::new_from_slice(&cached.dek).map_err(|_| TokenError::NoEffectiveKey)?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &plaintext, aad })
            .map_err(|_| TokenError::NoEffectiveKey)?;

        let mut wrapped = Vec::with_capacity(16 + 12 + ciphertext.len());
        wrapped.extend_from_slice(effective_id.as_bytes());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    /// Unwraps the envelope, looks up the DEK by embedded key id, and
    /// AES-GCM-opens with `aad`.
    pub async fn open_token(&self, bytes: &[u8], aad: &[u8]) -> TokenResult<Vec<KeyTriple>> {
        self.ensure_fresh().await?;

        if bytes.len() < 16 + 12 {
            return Err(TokenError::Tampered);
        }
        let (id_bytes, rest) = bytes.split_at(16);
        let (nonce_bytes, ciphertext) = rest.split_at(12);

        let key_id = Uuid::from_slice(id_bytes).map_err(|_| TokenError::UnknownKey)?;

        let cache = self.cache.read().await;
        let cached = cache.allowed.get(&key_id).ok_or(TokenError::UnknownKey)?;

        let cipher = Aes256Gcm::new_from_slice(&cached.dek).map_err(|_| TokenError::Tampered)?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| TokenError::Tampered)?;

        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Tampered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalEnvelopeKms;
    use std::sync::Arc;

    struct FixedLookup {
        key_id: Uuid,
        wrapped_dek: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl RevisionKeyLookup for FixedLookup {
        async fn allowed_key_ids(&self) -> RepoResult<Vec<Uuid>> {
            Ok(vec![self.key_id])
        }
        async fn effective_key_id(&self) -> RepoResult<Option<Uuid>> {
            Ok(Some(self.key_id))
        }
        async fn load_allowed_keys(&self) -> RepoResult<Vec<crate::model::RevisionKey>> {
            Ok(vec![crate::model::RevisionKey {
                id: self.key_id,
                created_at: Utc::now(),
                allowed: true,
                aad: vec![1, 2, 3],
                wrapped_dek: self.wrapped_dek.clone(),
            }])
        }
    }

    async fn build_manager() -> RevisionTokenManager {
        let kms: Arc<dyn Kms> = Arc::new(LocalEnvelopeKms::from_key_id("test"));
        let dek = vec![9u8; 32];
        let wrapped = kms.wrap(&dek).await.unwrap();
        let lookup: Arc<dyn RevisionKeyLookup> =
            Arc::new(FixedLookup { key_id: Uuid::new_v4(), wrapped_dek: wrapped });
        RevisionTokenManager::new(kms, lookup, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn make_then_open_round_trips() {
        let manager = build_manager().await;
        let keys = vec![KeyTriple { key_bytes: vec![1; 16], interval_number: 10, interval_count: 144 }];

        let token = manager.make_token(&keys, b"aad").await.unwrap();
        let opened = manager.open_token(&token, b"aad").await.unwrap();

        assert_eq!(opened, keys);
    }

    #[tokio::test]
    async fn mismatched_aad_fails_tampered() {
        let manager = build_manager().await;
        let keys = vec![KeyTriple { key_bytes: vec![1; 16], interval_number: 10, interval_count: 144 }];

        let token = manager.make_token(&keys, b"aad-1").await.unwrap();
        let result = manager.open_token(&token, b"aad-2").await;

        assert!(matches!(result, Err(TokenError::Tampered)));
    }

    #[tokio::test]
    async fn unknown_key_id_fails() {
        let manager = build_manager().await;
        let mut bogus = vec![0u8; 16 + 12 + 16];
        bogus[0] = 0xFF;

        let result = manager.open_token(&bogus, b"aad").await;
        assert!(matches!(result, Err(TokenError::UnknownKey)));
    }
}
