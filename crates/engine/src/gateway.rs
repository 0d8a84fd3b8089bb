//! Mutation Gateway: runs a write handler at most once per
//! `(endpoint, mutation_id)` and replays the stored response afterwards.
//!
//! The handler's writes and the ledger row share one snapshot. The store's
//! uniqueness constraint on the ledger key is the only serialization point:
//! a request that loses the race has its snapshot discarded and answers
//! with the winner's response.

use std::sync::Arc;

use async_trait::async_trait;
use intake_storage::{now_rfc3339, AssessmentStorage, MutationRecord, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::actor::Actor;
use crate::audit::{AuditEvent, AuditSink, MutationKind};
use crate::error::EngineError;
use crate::ledger::{fingerprint, LedgerLookup, MutationLedger};

/// Longest accepted client mutation id.
pub const MAX_MUTATION_ID_LEN: usize = 128;

/// A write handler the gateway can deduplicate.
#[async_trait]
pub trait Mutation<S: AssessmentStorage>: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send;

    fn kind(&self) -> MutationKind;

    /// Endpoint path the mutation id is scoped to.
    fn endpoint(&self) -> String;

    /// Everything that identifies the logical request. Two requests with the
    /// same mutation id must produce the same payload to be replays.
    fn payload(&self) -> Value;

    fn success_status(&self) -> u16 {
        200
    }

    /// Assessment the output refers to, for auditing.
    fn assessment_id(&self, output: &Self::Output) -> Option<String>;

    async fn apply(
        &self,
        storage: &S,
        snapshot: &mut S::Snapshot,
    ) -> Result<Self::Output, EngineError>;
}

/// A mutation result together with the exact body stored in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Replayed<T> {
    pub value: T,
    /// Response body; identical bytes on first execution and on replay.
    pub body: Value,
    pub replayed: bool,
    pub status_code: u16,
}

pub struct MutationGateway<S> {
    storage: Arc<S>,
    audit: Arc<dyn AuditSink>,
}

impl<S> Clone for MutationGateway<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            audit: Arc::clone(&self.audit),
        }
    }
}

impl<S: AssessmentStorage> MutationGateway<S> {
    pub fn new(storage: Arc<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self { storage, audit }
    }

    /// Run `mutation` under `mutation_id`, or without deduplication when no
    /// id was supplied.
    pub async fn execute<M: Mutation<S>>(
        &self,
        actor: &Actor,
        mutation_id: Option<&str>,
        mutation: M,
    ) -> Result<Replayed<M::Output>, EngineError> {
        let Some(mutation_id) = mutation_id else {
            return self.execute_untracked(actor, mutation).await;
        };
        validate_mutation_id(mutation_id)?;

        let endpoint = mutation.endpoint();
        let fingerprint = fingerprint(&endpoint, &mutation.payload());
        let ledger = MutationLedger::new(self.storage.as_ref());

        match ledger.lookup(&endpoint, mutation_id, &fingerprint).await? {
            LedgerLookup::Miss => {}
            LedgerLookup::Replay(row) => return self.replay(actor, &mutation, row),
            LedgerLookup::Conflict(_) => {
                return Err(payload_conflict(&endpoint, mutation_id));
            }
        }

        let mut snapshot = self.storage.begin_snapshot().await?;

        let output = match mutation.apply(self.storage.as_ref(), &mut snapshot).await {
            Ok(output) => output,
            Err(err) => {
                self.abort(snapshot).await;
                return self
                    .settle(actor, &mutation, &endpoint, mutation_id, &fingerprint, err)
                    .await;
            }
        };

        let body = match serde_json::to_value(&output) {
            Ok(body) => body,
            Err(e) => {
                self.abort(snapshot).await;
                return Err(EngineError::Internal(format!(
                    "response is not serializable: {e}"
                )));
            }
        };
        let status_code = mutation.success_status();

        if let Err(e) = ledger
            .record(
                &mut snapshot,
                &endpoint,
                mutation_id,
                &fingerprint,
                body.clone(),
                status_code,
            )
            .await
        {
            self.abort(snapshot).await;
            return self
                .settle(actor, &mutation, &endpoint, mutation_id, &fingerprint, e.into())
                .await;
        }

        if let Err(e) = self.storage.commit_snapshot(snapshot).await {
            if matches!(e, StorageError::DuplicateMutation { .. }) {
                tracing::debug!(%endpoint, mutation_id, "lost ledger race at commit");
            }
            return self
                .settle(actor, &mutation, &endpoint, mutation_id, &fingerprint, e.into())
                .await;
        }

        self.audit(actor, &mutation, &output, Some(mutation_id), false);
        Ok(Replayed {
            value: output,
            body,
            replayed: false,
            status_code,
        })
    }

    async fn execute_untracked<M: Mutation<S>>(
        &self,
        actor: &Actor,
        mutation: M,
    ) -> Result<Replayed<M::Output>, EngineError> {
        let mut snapshot = self.storage.begin_snapshot().await?;
        let output = match mutation.apply(self.storage.as_ref(), &mut snapshot).await {
            Ok(output) => output,
            Err(err) => {
                self.abort(snapshot).await;
                return Err(err);
            }
        };
        self.storage.commit_snapshot(snapshot).await?;

        let body = serde_json::to_value(&output)
            .map_err(|e| EngineError::Internal(format!("response is not serializable: {e}")))?;
        self.audit(actor, &mutation, &output, None, false);
        Ok(Replayed {
            value: output,
            body,
            replayed: false,
            status_code: mutation.success_status(),
        })
    }

    /// After a failed attempt, a ledger row for the key means another
    /// request applied the mutation first: replay it or report a conflict.
    /// Without a row the original error stands.
    async fn settle<M: Mutation<S>>(
        &self,
        actor: &Actor,
        mutation: &M,
        endpoint: &str,
        mutation_id: &str,
        fingerprint: &str,
        err: EngineError,
    ) -> Result<Replayed<M::Output>, EngineError> {
        let ledger = MutationLedger::new(self.storage.as_ref());
        match ledger.lookup(endpoint, mutation_id, fingerprint).await {
            Ok(LedgerLookup::Replay(row)) => self.replay(actor, mutation, row),
            Ok(LedgerLookup::Conflict(_)) => Err(payload_conflict(endpoint, mutation_id)),
            Ok(LedgerLookup::Miss) => Err(err),
            Err(lookup_err) => {
                tracing::warn!(
                    endpoint,
                    mutation_id,
                    error = %lookup_err,
                    "ledger re-read failed after mutation error"
                );
                Err(err)
            }
        }
    }

    fn replay<M: Mutation<S>>(
        &self,
        actor: &Actor,
        mutation: &M,
        row: MutationRecord,
    ) -> Result<Replayed<M::Output>, EngineError> {
        tracing::debug!(
            endpoint = %row.endpoint,
            mutation_id = %row.mutation_id,
            "replaying stored response"
        );
        let value: M::Output = serde_json::from_value(row.response.clone()).map_err(|e| {
            EngineError::Internal(format!(
                "stored response for mutation '{}' is unreadable: {e}",
                row.mutation_id
            ))
        })?;
        self.audit(actor, mutation, &value, Some(&row.mutation_id), true);
        Ok(Replayed {
            value,
            body: row.response,
            replayed: true,
            status_code: row.status_code,
        })
    }

    async fn abort(&self, snapshot: S::Snapshot) {
        if let Err(e) = self.storage.abort_snapshot(snapshot).await {
            tracing::warn!(error = %e, "failed to abort snapshot");
        }
    }

    fn audit<M: Mutation<S>>(
        &self,
        actor: &Actor,
        mutation: &M,
        output: &M::Output,
        mutation_id: Option<&str>,
        replayed: bool,
    ) {
        self.audit.emit(AuditEvent {
            kind: mutation.kind(),
            endpoint: mutation.endpoint(),
            mutation_id: mutation_id.map(str::to_string),
            patient_id: actor.patient_id.clone(),
            assessment_id: mutation.assessment_id(output),
            replayed,
            at: now_rfc3339(),
        });
    }
}

fn payload_conflict(endpoint: &str, mutation_id: &str) -> EngineError {
    tracing::warn!(endpoint, mutation_id, "mutation id reused with a different payload");
    EngineError::PayloadConflict {
        endpoint: endpoint.to_string(),
        mutation_id: mutation_id.to_string(),
    }
}

/// Ids are ledger keys as given, so surrounding whitespace is rejected
/// rather than trimmed: `" m1"` never aliases `"m1"`.
fn validate_mutation_id(mutation_id: &str) -> Result<(), EngineError> {
    if mutation_id.trim().is_empty() {
        return Err(EngineError::InvalidInput {
            reason: "mutation_id must not be empty".to_string(),
        });
    }
    if mutation_id.trim() != mutation_id {
        return Err(EngineError::InvalidInput {
            reason: "mutation_id must not start or end with whitespace".to_string(),
        });
    }
    if mutation_id.chars().count() > MAX_MUTATION_ID_LEN {
        return Err(EngineError::InvalidInput {
            reason: format!("mutation_id is longer than {MAX_MUTATION_ID_LEN} characters"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use intake_storage::{AnswerRecord, AssessmentRecord, AssessmentStatus, MemoryStorage};
    use rust_decimal::Decimal;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::audit::{ChannelAuditSink, NoopAuditSink};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counted {
        run: usize,
    }

    /// Upserts one answer and reports how many times it has run.
    struct CountingMutation {
        runs: Arc<AtomicUsize>,
        value: i64,
        fail_with: Option<EngineError>,
    }

    #[async_trait]
    impl Mutation<MemoryStorage> for CountingMutation {
        type Output = Counted;

        fn kind(&self) -> MutationKind {
            MutationKind::SaveAnswer
        }

        fn endpoint(&self) -> String {
            "/assessments/a1/answers".to_string()
        }

        fn payload(&self) -> Value {
            json!({"question_id": "q1", "value": self.value})
        }

        fn assessment_id(&self, _output: &Counted) -> Option<String> {
            Some("a1".to_string())
        }

        async fn apply(
            &self,
            storage: &MemoryStorage,
            snapshot: &mut <MemoryStorage as AssessmentStorage>::Snapshot,
        ) -> Result<Counted, EngineError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            storage
                .upsert_answer(
                    snapshot,
                    AnswerRecord {
                        id: format!("ans-{run}"),
                        assessment_id: "a1".to_string(),
                        question_id: "q1".to_string(),
                        value: Decimal::from(self.value),
                        raw_value: None,
                        answered_at: now_rfc3339(),
                    },
                )
                .await?;
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(Counted { run }),
            }
        }
    }

    async fn setup_with(
        audit: Arc<dyn AuditSink>,
    ) -> (MutationGateway<MemoryStorage>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .insert_assessment(
                &mut snap,
                AssessmentRecord {
                    id: "a1".to_string(),
                    patient_id: "p1".to_string(),
                    funnel_slug: "stress".to_string(),
                    legacy_funnel_id: None,
                    status: AssessmentStatus::InProgress,
                    current_step_id: None,
                    version: 0,
                    started_at: now_rfc3339(),
                    updated_at: now_rfc3339(),
                    completed_at: None,
                },
            )
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();
        (MutationGateway::new(Arc::clone(&storage), audit), storage)
    }

    async fn setup() -> (MutationGateway<MemoryStorage>, Arc<MemoryStorage>) {
        setup_with(Arc::new(NoopAuditSink)).await
    }

    fn counting(runs: &Arc<AtomicUsize>, value: i64) -> CountingMutation {
        CountingMutation {
            runs: Arc::clone(runs),
            value,
            fail_with: None,
        }
    }

    #[tokio::test]
    async fn second_call_replays_without_running_handler() {
        let (gateway, _) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let actor = Actor::patient("p1");

        let first = gateway
            .execute(&actor, Some("m1"), counting(&runs, 3))
            .await
            .unwrap();
        let second = gateway
            .execute(&actor, Some("m1"), counting(&runs, 3))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.body, second.body);
        assert_eq!(second.value, Counted { run: 1 });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_payload_is_a_conflict_and_does_not_run() {
        let (gateway, storage) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let actor = Actor::patient("p1");

        gateway
            .execute(&actor, Some("m1"), counting(&runs, 3))
            .await
            .unwrap();
        let err = gateway
            .execute(&actor, Some("m1"), counting(&runs, 4))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "payload-conflict");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let answers = storage.list_answers("a1").await.unwrap();
        assert_eq!(answers[0].value, Decimal::from(3));
    }

    #[tokio::test]
    async fn handler_errors_are_not_recorded() {
        let (gateway, storage) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let actor = Actor::patient("p1");

        let failing = CountingMutation {
            runs: Arc::clone(&runs),
            value: 3,
            fail_with: Some(EngineError::InvalidAnswer {
                reason: "nope".to_string(),
            }),
        };
        let err = gateway.execute(&actor, Some("m1"), failing).await.unwrap_err();
        assert_eq!(err.code(), "invalid-answer");
        assert!(storage.list_answers("a1").await.unwrap().is_empty());
        assert!(storage
            .get_mutation("/assessments/a1/answers", "m1")
            .await
            .unwrap()
            .is_none());

        let retried = gateway
            .execute(&actor, Some("m1"), counting(&runs, 3))
            .await
            .unwrap();
        assert!(!retried.replayed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_commit_failure_is_retryable_under_same_id() {
        let (gateway, storage) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let actor = Actor::patient("p1");

        storage.fail_next_commits(1);
        let err = gateway
            .execute(&actor, Some("m1"), counting(&runs, 3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "store-unavailable");
        assert!(err.is_retryable());

        let retried = gateway
            .execute(&actor, Some("m1"), counting(&runs, 3))
            .await
            .unwrap();
        assert!(!retried.replayed);
        assert_eq!(storage.list_answers("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mutation_ids_are_validated() {
        let (gateway, _) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let actor = Actor::patient("p1");

        let long = "x".repeat(MAX_MUTATION_ID_LEN + 1);
        for bad in ["", "   ", " m1", "m1\n", long.as_str()] {
            let err = gateway
                .execute(&actor, Some(bad), counting(&runs, 1))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "invalid-input");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn audit_events_mark_replays() {
        let (sink, mut rx) = ChannelAuditSink::new(8);
        let (gateway, _) = setup_with(Arc::new(sink)).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let actor = Actor::patient("p1");

        gateway
            .execute(&actor, Some("m1"), counting(&runs, 1))
            .await
            .unwrap();
        gateway
            .execute(&actor, Some("m1"), counting(&runs, 1))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.mutation_id.as_deref(), Some("m1"));
        assert_eq!(second.assessment_id.as_deref(), Some("a1"));
    }
}
