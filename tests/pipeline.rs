//! End-to-end exercise of reconcile -> lease -> verify -> transform ->
//! insert against in-memory test doubles, covering the happy-path and
//! bad-signature scenarios.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use exposure_exchange_core::config::Config;
use exposure_exchange_core::http_client::{DownloadError, HttpClient};
use exposure_exchange_core::keystore::InMemoryKeyStore;
use exposure_exchange_core::lock::InMemoryLockManager;
use exposure_exchange_core::model::{
    ArchiveContents, ExternalKey, PublicKey, SignatureAlgorithm, SignatureInfo, Source,
};
use exposure_exchange_core::repository::{InMemoryRepository, Repository};
use exposure_exchange_core::sync::run_sync;
use exposure_exchange_core::worker::run_worker_pool;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature as P256Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

struct FakeHttpClient {
    bodies: std::collections::HashMap<String, Vec<u8>>,
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn get_bytes(&self, url: &str, _timeout: std::time::Duration) -> Result<Vec<u8>, DownloadError> {
        self.bodies.get(url).cloned().ok_or(DownloadError::NotFound)
    }
}

fn build_archive_bytes(contents: &ArchiveContents, signing_key: &SigningKey, key_id: &str, key_version: &str) -> Vec<u8> {
    let contents_bytes = serde_json::to_vec(contents).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&contents_bytes);
    let digest = hasher.finalize();

    let signature: P256Signature = signing_key.sign(&digest);
    let signatures = vec![SignatureInfo {
        verification_key_id: key_id.to_string(),
        verification_key_version: key_version.to_string(),
        algorithm: SignatureAlgorithm::EcdsaSha256,
        signature_bytes: signature.to_der().as_bytes().to_vec(),
    }];

    let mut buf = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buf);
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::default();

        writer.start_file("export.bin", options).unwrap();
        writer.write_all(&contents_bytes).unwrap();

        writer.start_file("export.sig", options).unwrap();
        writer.write_all(&serde_json::to_vec(&signatures).unwrap()).unwrap();

        writer.finish().unwrap();
    }
    buf
}

fn test_config() -> Config {
    Config {
        database_url: String::new(),
        bind_addr: String::new(),
        kms_key_id: String::new(),
        max_runtime: std::time::Duration::from_secs(720),
        import_lock_time: std::time::Duration::from_secs(780),
        import_retry_rate: std::time::Duration::from_secs(3600),
        max_insert_batch_size: 100,
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

fn sample_key(interval_number: i64) -> ExternalKey {
    ExternalKey {
        key_bytes: vec![3u8; 16],
        interval_number,
        interval_count: 144,
        report_type: None,
        days_since_onset: None,
    }
}

#[tokio::test]
async fn happy_path_imports_two_archives() {
    let repository = Arc::new(InMemoryRepository::new());
    let locks = InMemoryLockManager::new();
    let key_store = InMemoryKeyStore::new();
    let config = test_config();

    let source = Source {
        id: Uuid::new_v4(),
        region: "US".to_string(),
        index_url: "https://example.com/index.txt".to_string(),
        export_root: "https://example.com/exports".to_string(),
        traveler: false,
        from_ts: Utc.timestamp_opt(0, 0).unwrap(),
        thru_ts: None,
    };
    repository.add_source(source.clone());

    let signing_key = SigningKey::random(&mut OsRng);
    let pem = signing_key.verifying_key().to_public_key_pem(Default::default()).unwrap();
    repository.add_public_key(PublicKey {
        source_id: source.id,
        key_id: "key-1".to_string(),
        key_version: "v1".to_string(),
        pem,
        from_ts: Utc.timestamp_opt(0, 0).unwrap(),
        thru_ts: None,
    });

    let old_interval = 2_000_000; // safely in the past
    let contents_a = ArchiveContents {
        start_timestamp: Utc::now(),
        end_timestamp: Utc::now(),
        region: "US".to_string(),
        keys: vec![sample_key(old_interval), sample_key(old_interval + 144)],
        revised_keys: vec![],
    };
    let contents_b = ArchiveContents {
        start_timestamp: Utc::now(),
        end_timestamp: Utc::now(),
        region: "US".to_string(),
        keys: vec![sample_key(old_interval + 288), sample_key(old_interval + 432)],
        revised_keys: vec![],
    };

    let mut bodies = std::collections::HashMap::new();
    bodies.insert(
        "https://example.com/index.txt".to_string(),
        b"a.zip\nb.zip\n".to_vec(),
    );
    bodies.insert(
        "https://example.com/exports/a.zip".to_string(),
        build_archive_bytes(&contents_a, &signing_key, "key-1", "v1"),
    );
    bodies.insert(
        "https://example.com/exports/b.zip".to_string(),
        build_archive_bytes(&contents_b, &signing_key, "key-1", "v1"),
    );
    let http = FakeHttpClient { bodies };

    run_sync(
        &locks,
        repository.as_ref(),
        &http,
        config.max_runtime,
        config.index_file_download_timeout,
    )
    .await
    .unwrap();

    let outcome = run_worker_pool(&locks, repository.as_ref(), &http, &key_store, &config)
        .await
        .unwrap();

    assert_eq!(outcome.leased, 2);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 0);
    assert_eq!(key_store.inserted_count(), 4);
}

#[tokio::test]
async fn bad_signature_archive_counts_as_failed() {
    let repository = Arc::new(InMemoryRepository::new());
    let locks = InMemoryLockManager::new();
    let key_store = InMemoryKeyStore::new();
    let config = test_config();

    let source = Source {
        id: Uuid::new_v4(),
        region: "US".to_string(),
        index_url: "https://example.com/index.txt".to_string(),
        export_root: "https://example.com/exports".to_string(),
        traveler: false,
        from_ts: Utc.timestamp_opt(0, 0).unwrap(),
        thru_ts: None,
    };
    repository.add_source(source.clone());

    let allowed_signing_key = SigningKey::random(&mut OsRng);
    let pem = allowed_signing_key.verifying_key().to_public_key_pem(Default::default()).unwrap();
    repository.add_public_key(PublicKey {
        source_id: source.id,
        key_id: "key-1".to_string(),
        key_version: "v1".to_string(),
        pem,
        from_ts: Utc.timestamp_opt(0, 0).unwrap(),
        thru_ts: None,
    });

    let rogue_signing_key = SigningKey::random(&mut OsRng);
    let contents_c = ArchiveContents {
        start_timestamp: Utc::now(),
        end_timestamp: Utc::now(),
        region: "US".to_string(),
        keys: vec![sample_key(2_000_000), sample_key(2_000_144)],
        revised_keys: vec![],
    };

    let mut bodies = std::collections::HashMap::new();
    bodies.insert("https://example.com/index.txt".to_string(), b"c.zip\n".to_vec());
    bodies.insert(
        "https://example.com/exports/c.zip".to_string(),
        build_archive_bytes(&contents_c, &rogue_signing_key, "key-1", "v1"),
    );
    let http = FakeHttpClient { bodies };

    run_sync(
        &locks,
        repository.as_ref(),
        &http,
        config.max_runtime,
        config.index_file_download_timeout,
    )
    .await
    .unwrap();

    let outcome = run_worker_pool(&locks, repository.as_ref(), &http, &key_store, &config)
        .await
        .unwrap();

    assert_eq!(outcome.leased, 1);
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(key_store.inserted_count(), 0);
}

#[tokio::test]
async fn removed_archive_transitions_to_failed() {
    let repository = Arc::new(InMemoryRepository::new());
    let locks = InMemoryLockManager::new();
    let config = test_config();

    let source = Source {
        id: Uuid::new_v4(),
        region: "US".to_string(),
        index_url: "https://example.com/index.txt".to_string(),
        export_root: "https://example.com/exports".to_string(),
        traveler: false,
        from_ts: Utc.timestamp_opt(0, 0).unwrap(),
        thru_ts: None,
    };
    repository.add_source(source.clone());

    let mut bodies = std::collections::HashMap::new();
    bodies.insert(
        "https://example.com/index.txt".to_string(),
        b"a.zip\nb.zip\n".to_vec(),
    );
    let http = FakeHttpClient { bodies: bodies.clone() };

    run_sync(&locks, repository.as_ref(), &http, config.max_runtime, config.index_file_download_timeout)
        .await
        .unwrap();

    bodies.insert("https://example.com/index.txt".to_string(), b"a.zip\n".to_vec());
    let http = FakeHttpClient { bodies };

    run_sync(&locks, repository.as_ref(), &http, config.max_runtime, config.index_file_download_timeout)
        .await
        .unwrap();

    let now = Utc::now();
    let remaining = repository
        .list_processable(source.id, config.import_lock_time, config.import_retry_rate, now)
        .await
        .unwrap();

    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].zip_url, "https://example.com/exports/a.zip");
}
