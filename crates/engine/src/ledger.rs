//! Mutation Ledger: one row per `(endpoint, mutation_id)` holding the
//! request fingerprint and the response that was returned.

use intake_storage::{now_rfc3339, AssessmentStorage, MutationRecord};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// Outcome of checking the ledger before running a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerLookup {
    /// No row: the mutation has not been applied.
    Miss,
    /// Same key, same fingerprint: return the stored response.
    Replay(MutationRecord),
    /// Same key, different fingerprint.
    Conflict(MutationRecord),
}

/// Compact JSON of `value` with object keys sorted at every depth.
///
/// `serde_json::Map` is a `BTreeMap` while the `preserve_order` feature is
/// off, so compact serialization already yields sorted keys.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Lowercase hex SHA-256 of the endpoint and the canonical payload.
pub fn fingerprint(endpoint: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Read and write access to the ledger table of a storage backend.
pub struct MutationLedger<'a, S> {
    storage: &'a S,
}

impl<'a, S: AssessmentStorage> MutationLedger<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    /// Committed row for the key, classified against `fingerprint`.
    pub async fn lookup(
        &self,
        endpoint: &str,
        mutation_id: &str,
        fingerprint: &str,
    ) -> Result<LedgerLookup, EngineError> {
        let stored = self.storage.get_mutation(endpoint, mutation_id).await?;
        Ok(match stored {
            None => LedgerLookup::Miss,
            Some(row) if row.fingerprint == fingerprint => LedgerLookup::Replay(row),
            Some(row) => LedgerLookup::Conflict(row),
        })
    }

    /// Insert the ledger row inside the handler's snapshot. Storage errors
    /// are returned untouched so the gateway can recognize a lost race.
    pub async fn record(
        &self,
        snapshot: &mut S::Snapshot,
        endpoint: &str,
        mutation_id: &str,
        fingerprint: &str,
        response: Value,
        status_code: u16,
    ) -> Result<(), intake_storage::StorageError> {
        self.storage
            .insert_mutation(
                snapshot,
                MutationRecord {
                    endpoint: endpoint.to_string(),
                    mutation_id: mutation_id.to_string(),
                    fingerprint: fingerprint.to_string(),
                    response,
                    status_code,
                    created_at: now_rfc3339(),
                },
            )
            .await
    }
}
