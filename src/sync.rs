//! C3 — Index Synchronizer.
//!
//! Locks at the deployment level (not per source): reconciliation is
//! already idempotent, so the lock primarily prevents thundering-herd
//! against the remote index servers.

use std::time::Duration;

use chrono::Utc;
use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::http_client::{DownloadError, HttpClient};
use crate::lock::{with_lock, LockManager};
use crate::repository::Repository;

pub const SCHEDULER_LOCK_NAME: &str = "import-scheduler-lock";

/// Builds an archive URL by joining `export_root` with a trimmed index
/// entry, treating the entry as a path fragment and collapsing redundant
/// separators.
fn build_archive_url(export_root: &str, name: &str) -> Result<String, CoreError> {
    let base = Url::parse(export_root).map_err(|e| CoreError::MalformedArchive(e.to_string()))?;
    let joined = base
        .join(&format!("{}/{}", base.path().trim_end_matches('/'), name))
        .map_err(|e| CoreError::MalformedArchive(e.to_string()))?;
    Ok(joined.to_string())
}

/// Splits an index file body into cleaned, non-empty filenames.
fn parse_index_body(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| line.trim().chars().filter(|c| !c.is_control()).collect::<String>())
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Runs one C3 pass across all active sources.
pub async fn run_sync(
    locks: &dyn LockManager,
    repository: &dyn Repository,
    http: &dyn HttpClient,
    max_runtime: Duration,
    index_timeout: Duration,
) -> CoreResult<()> {
    let result = with_lock(locks, SCHEDULER_LOCK_NAME, max_runtime, || async {
        let now = Utc::now();
        let sources = repository.list_active_sources(now).await?;

        let mut errors = Vec::new();

        for source in sources {
            let body_bytes = match http.get_bytes(&source.index_url, index_timeout).await {
                Ok(bytes) => bytes,
                Err(DownloadError::NotFound) => {
                    errors.push(format!("source {}: index not found", source.id));
                    continue;
                }
                Err(DownloadError::Other(msg)) => {
                    errors.push(format!("source {}: {}", source.id, msg));
                    continue;
                }
            };

            let body = match String::from_utf8(body_bytes) {
                Ok(body) => body,
                Err(e) => {
                    errors.push(format!("source {}: non-utf8 index body: {}", source.id, e));
                    continue;
                }
            };

            let names = parse_index_body(&body);

            let mut urls = Vec::with_capacity(names.len());
            let mut source_failed = false;
            for name in &names {
                match build_archive_url(&source.export_root, name) {
                    Ok(url) => urls.push(url),
                    Err(e) => {
                        errors.push(format!("source {}: {}", source.id, e));
                        source_failed = true;
                        break;
                    }
                }
            }
            if source_failed {
                continue;
            }

            if let Err(e) = repository.reconcile_archives(source.id, &urls, now).await {
                errors.push(format!("source {}: reconcile failed: {}", source.id, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::TransientDownload(errors.join("; ")))
        }
    })
    .await?;

    match result {
        Some(()) => Ok(()),
        None => Err(CoreError::AlreadyLocked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_index_body_trims_and_drops_blank_lines() {
        let body = "a.zip\n  b.zip  \n\nc.zip\n";
        let names = parse_index_body(body);
        assert_eq!(names, vec!["a.zip".to_string(), "b.zip".to_string(), "c.zip".to_string()]);
    }

    #[test]
    fn builds_archive_url_from_export_root() {
        let url = build_archive_url("https://example.com/exports", "a.zip").unwrap();
        assert_eq!(url, "https://example.com/exports/a.zip");
    }
}
