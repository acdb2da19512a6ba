//! The local exposure-key store is an external collaborator (out of scope
//! per §1); this module defines only the capability interface C6 inserts
//! through, plus an in-memory implementation for tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ExposureRecord, InsertOutcome, InsertPolicy};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("batch insert failed: {0}")]
    BatchFailed(String),
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Inserts one batch of records under `policy`, returning per-batch
    /// counts. The store is responsible for its own idempotency across
    /// re-imports; a batch error aborts the remaining batches for this
    /// archive.
    async fn insert_batch(
        &self,
        records: &[ExposureRecord],
        policy: &InsertPolicy,
    ) -> Result<InsertOutcome, KeyStoreError>;
}

/// In-memory key store used by tests and by the integration pipeline test.
#[derive(Default)]
pub struct InMemoryKeyStore {
    inserted: parking_lot::Mutex<Vec<(ExposureRecord, InsertPolicy)>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inserted_count(&self) -> usize {
        self.inserted.lock().len()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn insert_batch(
        &self,
        records: &[ExposureRecord],
        policy: &InsertPolicy,
    ) -> Result<InsertOutcome, KeyStoreError> {
        let mut guard = self.inserted.lock();
        for record in records {
            guard.push((record.clone(), policy.clone()));
        }
        Ok(InsertOutcome {
            inserted: records.len() as u64,
            revised: if policy.only_revisions { records.len() as u64 } else { 0 },
            dropped: 0,
        })
    }
}
