//! C2 — Source & Archive Repository.
//!
//! All multi-step operations use a read-committed transaction with explicit
//! row locks where a decision depends on current state. The `(source_id,
//! zip_url)` unique constraint is the ultimate idempotency guard for
//! discovery.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Archive, ArchiveStatus, PublicKey, Source};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not leasable")]
    NotLeasable,
    #[error("no matching public key row to expire")]
    PublicKeyNotFound,
    #[error("archive not in a completable state")]
    NotCompletable,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOutcome {
    pub added: u64,
    pub failed: u64,
}

#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn list_active_sources(&self, now: DateTime<Utc>) -> RepoResult<Vec<Source>>;
    async fn list_allowed_public_keys(&self, source_id: Uuid, now: DateTime<Utc>) -> RepoResult<Vec<PublicKey>>;
    async fn reconcile_archives(
        &self,
        source_id: Uuid,
        current_urls: &[String],
        now: DateTime<Utc>,
    ) -> RepoResult<ReconcileOutcome>;
    async fn list_processable(
        &self,
        source_id: Uuid,
        lock_ttl: std::time::Duration,
        retry_backoff: std::time::Duration,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<Archive>>;
    async fn lease(&self, archive_id: Uuid, lock_ttl: std::time::Duration, now: DateTime<Utc>) -> RepoResult<Archive>;
    async fn complete(&self, archive_id: Uuid, final_status: ArchiveStatus) -> RepoResult<()>;
    async fn expire_public_key(&self, source_id: Uuid, key_id: &str, key_version: &str, now: DateTime<Utc>) -> RepoResult<()>;

    /// Increments the retry counter for a failed-attempt archive. Telemetry
    /// only, per the design's single-shot-attempt semantics: the archive
    /// still transitions to COMPLETE regardless of this count.
    async fn increment_retries(&self, archive_id: Uuid) -> RepoResult<()>;
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Repository for PgRepository {
    async fn list_active_sources(&self, now: DateTime<Utc>) -> RepoResult<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(
            "SELECT id, region, index_url, export_root, traveler, from_ts, thru_ts
             FROM sources
             WHERE from_ts <= $1 AND (thru_ts IS NULL OR $1 < thru_ts)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    async fn list_allowed_public_keys(&self, source_id: Uuid, now: DateTime<Utc>) -> RepoResult<Vec<PublicKey>> {
        let keys = sqlx::query_as::<_, PublicKey>(
            "SELECT source_id, key_id, key_version, pem, from_ts, thru_ts
             FROM public_keys
             WHERE source_id = $1 AND (thru_ts IS NULL OR $2 < thru_ts)",
        )
        .bind(source_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn reconcile_archives(
        &self,
        source_id: Uuid,
        current_urls: &[String],
        now: DateTime<Utc>,
    ) -> RepoResult<ReconcileOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT id, zip_url FROM archives
             WHERE source_id = $1 AND status IN ('OPEN', 'PENDING')
             FOR UPDATE",
        )
        .bind(source_id)
        .fetch_all(&mut *tx)
        .await?;

        let existing_urls: std::collections::HashSet<&str> =
            existing.iter().map(|(_, url)| url.as_str()).collect();

        let mut outcome = ReconcileOutcome::default();

        for url in current_urls {
            if !existing_urls.contains(url.as_str()) {
                let inserted = sqlx::query(
                    "INSERT INTO archives (id, source_id, zip_url, discovered_at, status, retries)
                     VALUES ($1, $2, $3, $4, 'OPEN', 0)
                     ON CONFLICT (source_id, zip_url) DO NOTHING",
                )
                .bind(Uuid::new_v4())
                .bind(source_id)
                .bind(url)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() > 0 {
                    outcome.added += 1;
                }
            }
        }

        let current_set: std::collections::HashSet<&str> =
            current_urls.iter().map(|s| s.as_str()).collect();

        for (id, url) in &existing {
            if !current_set.contains(url.as_str()) {
                sqlx::query("UPDATE archives SET status = 'FAILED' WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                outcome.failed += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_processable(
        &self,
        source_id: Uuid,
        lock_ttl: std::time::Duration,
        retry_backoff: std::time::Duration,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<Archive>> {
        let lock_ttl_secs = lock_ttl.as_secs() as i64;
        let retry_backoff_secs = retry_backoff.as_secs() as i64;

        let archives = sqlx::query_as::<_, Archive>(
            "SELECT id, source_id, zip_url, discovered_at, processed_at, status, retries
             FROM archives
             WHERE source_id = $1
               AND (
                 (status = 'OPEN' AND (retries = 0 OR discovered_at + (retries * $2 || ' seconds')::interval <= $4))
                 OR
                 (status = 'PENDING' AND processed_at + ($3 || ' seconds')::interval <= $4)
               )
             ORDER BY id ASC",
        )
        .bind(source_id)
        .bind(retry_backoff_secs)
        .bind(lock_ttl_secs)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(archives)
    }

    async fn lease(&self, archive_id: Uuid, lock_ttl: std::time::Duration, now: DateTime<Utc>) -> RepoResult<Archive> {
        let mut tx = self.pool.begin().await?;

        let current: Option<Archive> = sqlx::query_as(
            "SELECT id, source_id, zip_url, discovered_at, processed_at, status, retries
             FROM archives WHERE id = $1 FOR UPDATE",
        )
        .bind(archive_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = current.ok_or(RepositoryError::NotLeasable)?;

        let leasable = match current.status {
            ArchiveStatus::Open => true,
            ArchiveStatus::Pending => current
                .processed_at
                .map(|processed_at| processed_at + chrono::Duration::from_std(lock_ttl).unwrap_or_default() <= now)
                .unwrap_or(false),
            _ => false,
        };

        if !leasable {
            return Err(RepositoryError::NotLeasable);
        }

        let leased: Archive = sqlx::query_as(
            "UPDATE archives SET status = 'PENDING', processed_at = $2
             WHERE id = $1
             RETURNING id, source_id, zip_url, discovered_at, processed_at, status, retries",
        )
        .bind(archive_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(leased)
    }

    async fn complete(&self, archive_id: Uuid, final_status: ArchiveStatus) -> RepoResult<()> {
        let status_str = match final_status {
            ArchiveStatus::Complete => "COMPLETE",
            ArchiveStatus::Failed => "FAILED",
            _ => return Err(RepositoryError::NotCompletable),
        };

        let result = sqlx::query(
            "UPDATE archives SET status = $2 WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(archive_id)
        .bind(status_str)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotCompletable);
        }
        Ok(())
    }

    async fn expire_public_key(&self, source_id: Uuid, key_id: &str, key_version: &str, now: DateTime<Utc>) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE public_keys SET thru_ts = $4
             WHERE source_id = $1 AND key_id = $2 AND key_version = $3
               AND (thru_ts IS NULL OR thru_ts > $4)",
        )
        .bind(source_id)
        .bind(key_id)
        .bind(key_version)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::PublicKeyNotFound);
        }
        Ok(())
    }

    async fn increment_retries(&self, archive_id: Uuid) -> RepoResult<()> {
        sqlx::query("UPDATE archives SET retries = retries + 1 WHERE id = $1")
            .bind(archive_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory repository used by tests and the integration pipeline test.
/// Mirrors the transactional semantics of [`PgRepository`] closely enough
/// for single-process exercising of the reconcile/lease/complete state
/// machine, without a live database.
#[derive(Default)]
pub struct InMemoryRepository {
    sources: parking_lot::Mutex<Vec<Source>>,
    public_keys: parking_lot::Mutex<Vec<PublicKey>>,
    archives: parking_lot::Mutex<Vec<Archive>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, source: Source) {
        self.sources.lock().push(source);
    }

    pub fn add_public_key(&self, key: PublicKey) {
        self.public_keys.lock().push(key);
    }
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn list_active_sources(&self, now: DateTime<Utc>) -> RepoResult<Vec<Source>> {
        Ok(self.sources.lock().iter().filter(|s| s.is_active_at(now)).cloned().collect())
    }

    async fn list_allowed_public_keys(&self, source_id: Uuid, now: DateTime<Utc>) -> RepoResult<Vec<PublicKey>> {
        Ok(self
            .public_keys
            .lock()
            .iter()
            .filter(|k| k.source_id == source_id && k.is_allowed_at(now))
            .cloned()
            .collect())
    }

    async fn reconcile_archives(
        &self,
        source_id: Uuid,
        current_urls: &[String],
        now: DateTime<Utc>,
    ) -> RepoResult<ReconcileOutcome> {
        let mut archives = self.archives.lock();
        let mut outcome = ReconcileOutcome::default();

        let existing_urls: std::collections::HashSet<String> = archives
            .iter()
            .filter(|a| a.source_id == source_id && matches!(a.status, ArchiveStatus::Open | ArchiveStatus::Pending))
            .map(|a| a.zip_url.clone())
            .collect();

        for url in current_urls {
            if !existing_urls.contains(url) {
                archives.push(Archive {
                    id: Uuid::new_v4(),
                    source_id,
                    zip_url: url.clone(),
                    discovered_at: now,
                    processed_at: None,
                    status: ArchiveStatus::Open,
                    retries: 0,
                });
                outcome.added += 1;
            }
        }

        let current_set: std::collections::HashSet<&str> = current_urls.iter().map(|s| s.as_str()).collect();
        for archive in archives.iter_mut() {
            if archive.source_id == source_id
                && matches!(archive.status, ArchiveStatus::Open | ArchiveStatus::Pending)
                && !current_set.contains(archive.zip_url.as_str())
            {
                archive.status = ArchiveStatus::Failed;
                outcome.failed += 1;
            }
        }

        Ok(outcome)
    }

    async fn list_processable(
        &self,
        source_id: Uuid,
        lock_ttl: std::time::Duration,
        retry_backoff: std::time::Duration,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<Archive>> {
        let lock_ttl = chrono::Duration::from_std(lock_ttl).unwrap_or_default();
        let retry_backoff = chrono::Duration::from_std(retry_backoff).unwrap_or_default();

        let mut result: Vec<Archive> = self
            .archives
            .lock()
            .iter()
            .filter(|a| a.source_id == source_id)
            .filter(|a| match a.status {
                ArchiveStatus::Open => a.retries == 0 || a.discovered_at + retry_backoff * a.retries <= now,
                ArchiveStatus::Pending => a.processed_at.map_or(false, |p| p + lock_ttl <= now),
                _ => false,
            })
            .cloned()
            .collect();

        result.sort_by_key(|a| a.id);
        Ok(result)
    }

    async fn lease(&self, archive_id: Uuid, lock_ttl: std::time::Duration, now: DateTime<Utc>) -> RepoResult<Archive> {
        let lock_ttl = chrono::Duration::from_std(lock_ttl).unwrap_or_default();
        let mut archives = self.archives.lock();
        let archive = archives
            .iter_mut()
            .find(|a| a.id == archive_id)
            .ok_or(RepositoryError::NotLeasable)?;

        let leasable = match archive.status {
            ArchiveStatus::Open => true,
            ArchiveStatus::Pending => archive.processed_at.map_or(false, |p| p + lock_ttl <= now),
            _ => false,
        };

        if !leasable {
            return Err(RepositoryError::NotLeasable);
        }

        archive.status = ArchiveStatus::Pending;
        archive.processed_at = Some(now);
        Ok(archive.clone())
    }

    async fn complete(&self, archive_id: Uuid, final_status: ArchiveStatus) -> RepoResult<()> {
        let mut archives = self.archives.lock();
        let archive = archives
            .iter_mut()
            .find(|a| a.id == archive_id)
            .ok_or(RepositoryError::NotCompletable)?;

        if archive.status != ArchiveStatus::Pending {
            return Err(RepositoryError::NotCompletable);
        }
        archive.status = final_status;
        Ok(())
    }

    async fn expire_public_key(&self, source_id: Uuid, key_id: &str, key_version: &str, now: DateTime<Utc>) -> RepoResult<()> {
        let mut keys = self.public_keys.lock();
        let key = keys
            .iter_mut()
            .find(|k| k.source_id == source_id && k.key_id == key_id && k.key_version == key_version && k.is_allowed_at(now))
            .ok_or(RepositoryError::PublicKeyNotFound)?;
        key.thru_ts = Some(now);
        Ok(())
    }

    async fn increment_retries(&self, archive_id: Uuid) -> RepoResult<()> {
        let mut archives = self.archives.lock();
        if let Some(archive) = archives.iter_mut().find(|a| a.id == archive_id) {
            archive.retries += 1;
        }
        Ok(())
    }
}
