//! C7 — Revision-Key Rotator.
//!
//! Creates a new data-encryption key when the current effective key is old
//! enough, and destroys older allowed keys once a newer key has been
//! effective for the full retention period. Grounded on the
//! mark-deprecated-then-insert-new transaction shape used for key rotation
//! in the encryption key-rotation reference service, adapted to this
//! crate's KMS-wrap + lock-manager primitives.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::kms::Kms;
use crate::lock::{with_lock, LockManager};

pub const KEY_ROTATION_LOCK_NAME: &str = "key-rotation-lock";
const KEY_ROTATION_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy)]
pub struct RotationOutcome {
    pub created: u64,
    pub deleted: u64,
}

/// Reads allowed revision keys ordered by `created_at DESC` (newest first).
async fn load_allowed_keys_desc(pool: &PgPool) -> Result<Vec<(Uuid, DateTime<Utc>)>, sqlx::Error> {
    sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
        "SELECT id, created_at FROM revision_keys WHERE allowed = true ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
}

async fn insert_new_key(pool: &PgPool, kms: &dyn Kms, now: DateTime<Utc>) -> Result<Uuid, crate::kms::KmsError> {
    let mut dek = vec![0u8; 32];
    OsRng.fill_bytes(&mut dek);
    let mut aad = vec![0u8; 16];
    OsRng.fill_bytes(&mut aad);

    let wrapped_dek = kms.wrap(&dek).await?;
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO revision_keys (id, created_at, allowed, aad, wrapped_dek) VALUES ($1, $2, true, $3, $4)",
    )
    .bind(id)
    .bind(now)
    .bind(&aad)
    .bind(&wrapped_dek)
    .execute(pool)
    .await
    .map_err(|e| crate::kms::KmsError::WrapFailed(e.to_string()))?;

    Ok(id)
}

/// Zeroes the wrapped cipher and clears `allowed` in place; the row
/// remains so historical references still resolve to an inactive id.
async fn destroy_key(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE revision_keys SET wrapped_dek = '\\x'::bytea, allowed = false WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Runs one C7 pass: create a new effective key if due, then walk the
/// remaining allowed keys destroying any whose *previous* key has been
/// effective for at least `delete_old_key_period`. Guarded by the
/// `key-rotation-lock`, so two replicas can never both decide a new key is
/// needed or destroy a key the other is mid-read on: the invariant that
/// exactly one effective key exists at any instant depends on this.
pub async fn run_rotation(
    locks: &dyn LockManager,
    pool: &PgPool,
    kms: &dyn Kms,
    new_key_period: Duration,
    delete_old_key_period: Duration,
    now: DateTime<Utc>,
) -> CoreResult<RotationOutcome> {
    let result = with_lock(locks, KEY_ROTATION_LOCK_NAME, KEY_ROTATION_LOCK_TTL, || async {
        let mut outcome = RotationOutcome::default();

        let mut keys = load_allowed_keys_desc(pool)
            .await
            .map_err(|e| CoreError::TransientDb(e.to_string()))?;

        let needs_new_key = match keys.first() {
            None => true,
            Some((_, created_at)) => {
                now.signed_duration_since(*created_at)
                    >= chrono::Duration::from_std(new_key_period).unwrap_or_default()
            }
        };

        if needs_new_key {
            let new_id = insert_new_key(pool, kms, now)
                .await
                .map_err(|e| CoreError::Kms(e.to_string()))?;
            outcome.created += 1;
            keys.insert(0, (new_id, now));
        }

        // keys[0] is now the effective key; walk the rest carrying the
        // previous key's age forward.
        let mut previous_created_at = keys.first().map(|(_, created_at)| *created_at).unwrap_or(now);

        for (id, created_at) in keys.iter().skip(1) {
            let previous_age = now.signed_duration_since(previous_created_at);
            if previous_age >= chrono::Duration::from_std(delete_old_key_period).unwrap_or_default() {
                destroy_key(pool, *id).await.map_err(|e| CoreError::TransientDb(e.to_string()))?;
                outcome.deleted += 1;
            }
            previous_created_at = *created_at;
        }

        tracing::info!(created = outcome.created, deleted = outcome.deleted, "revision key rotation complete");

        Ok(outcome)
    })
    .await?;

    match result {
        Some(outcome) => Ok(outcome),
        None => Err(CoreError::AlreadyLocked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_defaults_to_zero() {
        let outcome = RotationOutcome::default();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.deleted, 0);
    }
}
