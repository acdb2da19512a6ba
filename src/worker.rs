//! C4 — Archive Worker Pool.
//!
//! For each active source, gate on a per-source lock, lease eligible
//! archives, and run the verify → transform → insert pipeline on each in
//! listed order, respecting the job's wall-clock deadline.

use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreResult;
use crate::http_client::{DownloadError, HttpClient};
use crate::keystore::KeyStore;
use crate::lock::{with_lock, LockManager};
use crate::model::ArchiveStatus;
use crate::repository::{Repository, RepositoryError};
use crate::verify::{verify_archive, VerifyError};
use crate::transform::transform_and_insert;

pub fn worker_lock_name(source_id: Uuid) -> String {
    format!("export-importer-worker-lock-{source_id}")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerOutcome {
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Runs the verify+transform+insert pipeline for one archive. A special
/// case: an archive whose `zip_url` equals the source's `export_root` is a
/// historical malformed row; it returns a trivial empty success.
async fn run_pipeline(
    http: &dyn HttpClient,
    key_store: &dyn KeyStore,
    repository: &dyn Repository,
    config: &Config,
    source: &crate::model::Source,
    archive: &crate::model::Archive,
) -> CoreResult<()> {
    if archive.zip_url == source.export_root {
        return Ok(());
    }

    let bytes = match http
        .get_bytes(&archive.zip_url, config.export_file_download_timeout)
        .await
    {
        Ok(bytes) => bytes,
        Err(DownloadError::NotFound) => return Err(crate::error::CoreError::ArchiveNotFound),
        Err(DownloadError::Other(msg)) => return Err(crate::error::CoreError::TransientDownload(msg)),
    };

    let allowed_keys = repository.list_allowed_public_keys(source.id, Utc::now()).await?;

    let verified = match verify_archive(&bytes, &allowed_keys) {
        Ok(verified) => verified,
        Err(VerifyError::Unauthentic) => return Err(crate::error::CoreError::Unauthentic),
        Err(VerifyError::Malformed(msg)) => return Err(crate::error::CoreError::MalformedArchive(msg)),
    };

    transform_and_insert(
        key_store,
        &verified.contents.keys,
        &verified.contents.revised_keys,
        source,
        archive,
        config,
    )
    .await
    .map_err(|e| crate::error::CoreError::Internal(anyhow::anyhow!(e.to_string())))?;

    Ok(())
}

/// Runs one C4 pass across all active sources.
pub async fn run_worker_pool(
    locks: &dyn LockManager,
    repository: &dyn Repository,
    http: &dyn HttpClient,
    key_store: &dyn KeyStore,
    config: &Config,
) -> CoreResult<WorkerOutcome> {
    let deadline = Instant::now() + config.max_runtime;
    let mut outcome = WorkerOutcome::default();

    let now = Utc::now();
    let sources = repository.list_active_sources(now).await?;

    for source in sources {
        if Instant::now() >= deadline {
            break;
        }

        let lock_name = worker_lock_name(source.id);
        let source_result: Result<(), crate::error::CoreError> = {
            let run = with_lock(locks, &lock_name, config.max_runtime, || async {
                process_source(
                    repository,
                    http,
                    key_store,
                    config,
                    &source,
                    deadline,
                    &mut outcome,
                )
                .await
            })
            .await;

            match run {
                Ok(Some(())) => Ok(()),
                Ok(None) => Ok(()), // already locked: skip this source, continue with next
                Err(e) => Err(e),
            }
        };

        source_result?;
    }

    Ok(outcome)
}

async fn process_source(
    repository: &dyn Repository,
    http: &dyn HttpClient,
    key_store: &dyn KeyStore,
    config: &Config,
    source: &crate::model::Source,
    deadline: Instant,
    outcome: &mut WorkerOutcome,
) -> CoreResult<()> {
    let now = Utc::now();
    let candidates = repository
        .list_processable(source.id, config.import_lock_time, config.import_retry_rate, now)
        .await?;

    if candidates.is_empty() {
        return Ok(());
    }

    for archive in candidates {
        if Instant::now() >= deadline {
            break;
        }

        let leased = match repository.lease(archive.id, config.import_lock_time, Utc::now()).await {
            Ok(leased) => leased,
            Err(RepositoryError::NotLeasable) => return Ok(()),
            Err(other) => return Err(other.into()),
        };
        outcome.leased += 1;

        match run_pipeline(http, key_store, repository, config, source, &leased).await {
            Ok(()) => {
                repository.complete(leased.id, ArchiveStatus::Complete).await?;
                outcome.completed += 1;
            }
            Err(e) => {
                tracing::warn!(archive = %leased.id, error = %e, "archive import failed, counted for telemetry only");
                let _ = repository.increment_retries(leased.id).await;
                repository.complete(leased.id, ArchiveStatus::Complete).await?;
                outcome.failed += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_lock_name_is_per_source() {
        let id = Uuid::new_v4();
        assert_eq!(worker_lock_name(id), format!("export-importer-worker-lock-{id}"));
    }
}
