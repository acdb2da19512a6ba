//! C6 — Key Transformer & Insert.
//!
//! Converts external keys parsed out of a verified archive into
//! local-schema exposure records, applying rejection rules, provenance
//! stamping, and the same-day future-dating fix-up, then delegates
//! batched insertion to the external key store.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::keystore::{KeyStore, KeyStoreError};
use crate::model::{Archive, ExposureRecord, ExternalKey, InsertOutcome, InsertPolicy, Source};

/// Ten-minute exposure-key intervals, matching the Exposure Notification
/// framework's interval granularity.
const INTERVAL_LENGTH_SECS: i64 = 600;

fn interval_to_instant(interval_number: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(interval_number * INTERVAL_LENGTH_SECS, 0).single()
}

fn truncate_down(instant: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
    let window_secs = window.as_secs().max(1) as i64;
    let epoch_secs = instant.timestamp();
    let truncated = epoch_secs - epoch_secs.rem_euclid(window_secs);
    Utc.timestamp_opt(truncated, 0).single().unwrap_or(instant)
}

fn round_up(instant: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
    let floor = truncate_down(instant, window);
    if floor == instant {
        floor
    } else {
        floor + ChronoDuration::seconds(window.as_secs() as i64)
    }
}

/// Transforms one external key into a local exposure record, or `None` if
/// it is rejected outright.
pub fn transform_key(
    key: &ExternalKey,
    source: &Source,
    archive: &Archive,
    config: &Config,
    now: DateTime<Utc>,
) -> Option<ExposureRecord> {
    if key.key_bytes.len() != 16 {
        return None;
    }
    if !(1..=144).contains(&key.interval_count) {
        return None;
    }
    if key.interval_number <= 0 {
        return None;
    }
    if let Some(days) = key.days_since_onset {
        if days.unsigned_abs() as i64 > config.max_symptom_onset_days {
            return None;
        }
    }

    let mut created_at = truncate_down(now, config.truncate_window);

    let validity_end_interval = key.interval_number + key.interval_count as i64;
    if let Some(validity_end) = interval_to_instant(validity_end_interval) {
        if validity_end > now {
            created_at = round_up(validity_end, config.truncate_window);
        }
    }

    Some(ExposureRecord {
        key_bytes: key.key_bytes.clone(),
        interval_number: key.interval_number,
        interval_count: key.interval_count,
        app_package_name: config.import_app_package_name.clone(),
        regions: vec![source.region.clone()],
        traveler: source.traveler,
        export_import_id: source.id,
        import_file_id: archive.id,
        local_provenance: false,
        created_at,
        report_type: key.report_type.or(config.backfill_report_type),
        days_since_onset: key.days_since_onset.or(config.backfill_days_since_onset_value),
    })
}

/// Transforms a whole key list, tracking how many were rejected.
pub fn transform_keys(
    keys: &[ExternalKey],
    source: &Source,
    archive: &Archive,
    config: &Config,
) -> (Vec<ExposureRecord>, u64) {
    let now = Utc::now();
    let mut records = Vec::with_capacity(keys.len());
    let mut dropped = 0u64;

    for key in keys {
        match transform_key(key, source, archive, config, now) {
            Some(record) => records.push(record),
            None => dropped += 1,
        }
    }

    (records, dropped)
}

/// Inserts `records` in batches of `config.max_insert_batch_size`. A batch
/// error aborts the remaining batches; already-inserted batches are
/// retained, since the key store owns its own re-import idempotency.
pub async fn insert_in_batches(
    key_store: &dyn KeyStore,
    records: &[ExposureRecord],
    policy: &InsertPolicy,
    config: &Config,
) -> Result<InsertOutcome, KeyStoreError> {
    let mut total = InsertOutcome::default();

    for batch in records.chunks(config.max_insert_batch_size.max(1)) {
        let outcome = key_store.insert_batch(batch, policy).await?;
        total += outcome;
    }

    Ok(total)
}

/// Runs the full C6 contract for one verified archive: transform and insert
/// both the primary and revised key lists with their respective policies.
pub async fn transform_and_insert(
    key_store: &dyn KeyStore,
    primary_keys: &[ExternalKey],
    revised_keys: &[ExternalKey],
    source: &Source,
    archive: &Archive,
    config: &Config,
) -> Result<InsertOutcome, KeyStoreError> {
    let (primary_records, primary_dropped) = transform_keys(primary_keys, source, archive, config);
    let (revised_records, revised_dropped) = transform_keys(revised_keys, source, archive, config);

    let primary_policy = InsertPolicy { skip_revisions: true, ..Default::default() };
    let revised_policy = InsertPolicy {
        only_revisions: true,
        require_token: false,
        require_export_import_id: true,
        allow_clinical_reports: false,
        allow_revoked: true,
        ..Default::default()
    };

    let mut total = insert_in_batches(key_store, &primary_records, &primary_policy, config).await?;
    total += insert_in_batches(key_store, &revised_records, &revised_policy, config).await?;
    total.dropped += primary_dropped + revised_dropped;

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            bind_addr: String::new(),
            kms_key_id: String::new(),
            max_runtime: std::time::Duration::from_secs(720),
            import_lock_time: std::time::Duration::from_secs(780),
            import_retry_rate: std::time::Duration::from_secs(3600),
            max_insert_batch_size: 2,
            max_interval_age_on_publish: std::time::Duration::from_secs(360 * 3600),
            max_symptom_onset_days: 14,
            truncate_window: std::time::Duration::from_secs(3600),
            new_key_period: std::time::Duration::from_secs(168 * 3600),
            delete_old_key_period: std::time::Duration::from_secs(360 * 3600),
            import_app_package_name: "com.example.app".to_string(),
            index_file_download_timeout: std::time::Duration::from_secs(60),
            export_file_download_timeout: std::time::Duration::from_secs(120),
            backfill_report_type: None,
            backfill_days_since_onset_value: None,
        }
    }

    fn test_source() -> Source {
        Source {
            id: Uuid::new_v4(),
            region: "US".to_string(),
            index_url: "https://example.com/index.txt".to_string(),
            export_root: "https://example.com/exports/".to_string(),
            traveler: false,
            from_ts: Utc.timestamp_opt(0, 0).unwrap(),
            thru_ts: None,
        }
    }

    fn test_archive(source_id: Uuid) -> Archive {
        Archive {
            id: Uuid::new_v4(),
            source_id,
            zip_url: "https://example.com/exports/a.zip".to_string(),
            discovered_at: Utc::now(),
            processed_at: None,
            status: crate::model::ArchiveStatus::Pending,
            retries: 0,
        }
    }

    #[test]
    fn rejects_wrong_key_length() {
        let source = test_source();
        let archive = test_archive(source.id);
        let config = test_config();

        let key = ExternalKey {
            key_bytes: vec![0u8; 10],
            interval_number: 2650847,
            interval_count: 144,
            report_type: None,
            days_since_onset: None,
        };

        assert!(transform_key(&key, &source, &archive, &config, Utc::now()).is_none());
    }

    #[test]
    fn rejects_out_of_range_interval_count() {
        let source = test_source();
        let archive = test_archive(source.id);
        let config = test_config();

        let key = ExternalKey {
            key_bytes: vec![0u8; 16],
            interval_number: 2650847,
            interval_count: 200,
            report_type: None,
            days_since_onset: None,
        };

        assert!(transform_key(&key, &source, &archive, &config, Utc::now()).is_none());
    }

    #[test]
    fn stamps_provenance_fields() {
        let source = test_source();
        let archive = test_archive(source.id);
        let config = test_config();

        let key = ExternalKey {
            key_bytes: vec![1u8; 16],
            interval_number: 2650000,
            interval_count: 144,
            report_type: None,
            days_since_onset: None,
        };

        let record = transform_key(&key, &source, &archive, &config, Utc::now()).unwrap();
        assert_eq!(record.regions, vec!["US".to_string()]);
        assert!(!record.local_provenance);
        assert_eq!(record.export_import_id, source.id);
        assert_eq!(record.import_file_id, archive.id);
    }

    #[test]
    fn backfills_report_type_and_onset_when_key_omits_them() {
        let source = test_source();
        let archive = test_archive(source.id);
        let mut config = test_config();
        config.backfill_report_type = Some(1);
        config.backfill_days_since_onset_value = Some(3);

        let key = ExternalKey {
            key_bytes: vec![1u8; 16],
            interval_number: 2650000,
            interval_count: 144,
            report_type: None,
            days_since_onset: None,
        };

        let record = transform_key(&key, &source, &archive, &config, Utc::now()).unwrap();
        assert_eq!(record.report_type, Some(1));
        assert_eq!(record.days_since_onset, Some(3));
    }

    #[test]
    fn does_not_override_report_type_and_onset_when_key_sets_them() {
        let source = test_source();
        let archive = test_archive(source.id);
        let mut config = test_config();
        config.backfill_report_type = Some(1);
        config.backfill_days_since_onset_value = Some(3);

        let key = ExternalKey {
            key_bytes: vec![1u8; 16],
            interval_number: 2650000,
            interval_count: 144,
            report_type: Some(2),
            days_since_onset: Some(5),
        };

        let record = transform_key(&key, &source, &archive, &config, Utc::now()).unwrap();
        assert_eq!(record.report_type, Some(2));
        assert_eq!(record.days_since_onset, Some(5));
    }

    #[test]
    fn future_dated_key_advances_created_at() {
        let source = test_source();
        let archive = test_archive(source.id);
        let config = test_config();
        let now = Utc::now();

        let today_midnight_interval = (now.timestamp() / 86400) * 86400 / INTERVAL_LENGTH_SECS;
        let key = ExternalKey {
            key_bytes: vec![1u8; 16],
            interval_number: today_midnight_interval,
            interval_count: 144,
            report_type: None,
            days_since_onset: None,
        };

        let record = transform_key(&key, &source, &archive, &config, now).unwrap();
        let validity_end = interval_to_instant(today_midnight_interval + 144).unwrap();
        if validity_end > now {
            assert!(record.created_at >= validity_end);
        }
    }
}
