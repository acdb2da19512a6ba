//! C1 — Distributed Lock Manager.
//!
//! Single-holder named leases backed by the same transactional store that
//! hosts the repository (C2), so lock ownership and data writes can be
//! reasoned about without cross-store coordination. Adapted from the
//! Redis `SET NX EX` + compare-and-delete shape onto a Postgres table:
//! acquisition is an upsert guarded by expiry, release is a holder-checked
//! delete.

use std::time::Duration;

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("already locked")]
    AlreadyLocked,
    #[error("lock store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// A held lease. Dropping it does not release the lock — callers must call
/// [`Lease::release`] explicitly so release failures can be logged without
/// panicking in a destructor.
pub struct Lease {
    name: String,
    holder: Uuid,
}

#[async_trait::async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Lease>;
    async fn release(&self, lease: Lease) -> LockResult<()>;
}

pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LockManager for PgLockManager {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Lease> {
        let holder = Uuid::new_v4();
        let ttl_secs = ttl.as_secs() as f64;

        let row = sqlx::query(
            r#"
            INSERT INTO distributed_locks (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + ($3 || ' seconds')::interval)
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE distributed_locks.expires_at <= now()
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl_secs.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(_) => Ok(Lease { name: name.to_string(), holder }),
            None => Err(LockError::AlreadyLocked),
        }
    }

    async fn release(&self, lease: Lease) -> LockResult<()> {
        sqlx::query("DELETE FROM distributed_locks WHERE name = $1 AND holder = $2")
            .bind(&lease.name)
            .bind(lease.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Runs `body` under `name` for `ttl`. On `AlreadyLocked`, resolves to
/// `Ok(None)` without invoking `body` — the caller treats this as success,
/// matching §7's `ALREADY_LOCKED` discipline. Release failures are logged,
/// never override the body's result: the TTL is the safety net.
pub async fn with_lock<F, Fut, T, E>(
    locks: &dyn LockManager,
    name: &str,
    ttl: Duration,
    body: F,
) -> Result<Option<T>, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    let lease = match locks.acquire(name, ttl).await {
        Ok(lease) => lease,
        Err(LockError::AlreadyLocked) => return Ok(None),
        Err(other) => return Err(other.into()),
    };

    let result = body().await;

    if let Err(release_err) = locks.release(lease).await {
        tracing::warn!(lock = name, error = %release_err, "lock release failed, relying on ttl");
    }

    result.map(Some)
}

/// In-memory lock manager used by tests and the integration pipeline test.
pub struct InMemoryLockManager {
    held: parking_lot::Mutex<std::collections::HashMap<String, std::time::Instant>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self { held: parking_lot::Mutex::new(std::collections::HashMap::new()) }
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Lease> {
        let mut held = self.held.lock();
        let now = std::time::Instant::now();

        if let Some(expires_at) = held.get(name) {
            if *expires_at > now {
                return Err(LockError::AlreadyLocked);
            }
        }

        held.insert(name.to_string(), now + ttl);
        Ok(Lease { name: name.to_string(), holder: Uuid::new_v4() })
    }

    async fn release(&self, lease: Lease) -> LockResult<()> {
        self.held.lock().remove(&lease.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_carries_name_and_holder() {
        let lease = Lease { name: "import-scheduler-lock".to_string(), holder: Uuid::new_v4() };
        assert_eq!(lease.name, "import-scheduler-lock");
    }
}
