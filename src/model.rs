//! Durable row types shared by the repository, sync, worker, and rotation components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote health authority publishing exports.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub region: String,
    pub index_url: String,
    pub export_root: String,
    pub traveler: bool,
    pub from_ts: DateTime<Utc>,
    pub thru_ts: Option<DateTime<Utc>>,
}

impl Source {
    /// A source is active at `now` iff `from <= now` and (`thru` is null or `now < thru`).
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.from_ts <= now && self.thru_ts.map_or(true, |thru| now < thru)
    }
}

/// `(source_id, key_id, key_version)` identified PEM-encoded ECDSA P-256 public key.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct PublicKey {
    pub source_id: Uuid,
    pub key_id: String,
    pub key_version: String,
    pub pem: String,
    pub from_ts: DateTime<Utc>,
    pub thru_ts: Option<DateTime<Utc>>,
}

impl PublicKey {
    /// A key is allowed at `now` iff `thru` is null or `now < thru`.
    pub fn is_allowed_at(&self, now: DateTime<Utc>) -> bool {
        self.thru_ts.map_or(true, |thru| now < thru)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ArchiveStatus {
    Open,
    Pending,
    Complete,
    Failed,
}

/// Durable row per discovered remote archive URL.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Archive {
    pub id: Uuid,
    pub source_id: Uuid,
    pub zip_url: String,
    pub discovered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: ArchiveStatus,
    pub retries: i32,
}

/// A process-wide data-encryption key used to protect revision tokens.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RevisionKey {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub allowed: bool,
    /// Random associated data bound to this key's AEAD usage.
    pub aad: Vec<u8>,
    /// KMS-wrapped data-encryption key; zeroed once the key is destroyed.
    pub wrapped_dek: Vec<u8>,
}

/// A single 16-byte temporary exposure key plus validity interval, as it
/// appears inside an archive's contents blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalKey {
    pub key_bytes: Vec<u8>,
    pub interval_number: i64,
    pub interval_count: i32,
    pub report_type: Option<i32>,
    pub days_since_onset: Option<i32>,
}

/// The parsed, not-yet-verified contents of an archive's binary blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveContents {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub region: String,
    pub keys: Vec<ExternalKey>,
    pub revised_keys: Vec<ExternalKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    EcdsaSha256,
}

/// One entry inside an archive's signatures blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub verification_key_id: String,
    pub verification_key_version: String,
    pub algorithm: SignatureAlgorithm,
    pub signature_bytes: Vec<u8>,
}

/// A local-schema exposure key record, ready for insertion into the
/// external key store, carrying the provenance fields C6 stamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub key_bytes: Vec<u8>,
    pub interval_number: i64,
    pub interval_count: i32,
    pub app_package_name: String,
    pub regions: Vec<String>,
    pub traveler: bool,
    pub export_import_id: Uuid,
    pub import_file_id: Uuid,
    pub local_provenance: bool,
    pub created_at: DateTime<Utc>,
    pub report_type: Option<i32>,
    pub days_since_onset: Option<i32>,
}

/// Policy flags threaded through the external key store's insert call.
#[derive(Debug, Clone, Default)]
pub struct InsertPolicy {
    pub skip_revisions: bool,
    pub only_revisions: bool,
    pub require_token: bool,
    pub require_export_import_id: bool,
    pub allow_clinical_reports: bool,
    pub allow_revoked: bool,
}

/// Per-batch outcome reported by the external key store.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub revised: u64,
    pub dropped: u64,
}

impl std::ops::AddAssign for InsertOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.revised += rhs.revised;
        self.dropped += rhs.dropped;
    }
}
