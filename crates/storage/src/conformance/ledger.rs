//! Mutation ledger conformance tests: write-once rows keyed by
//! (endpoint, mutation id).

use std::future::Future;

use super::{make_mutation, TestResult};
use crate::{AssessmentStorage, StorageError};

pub(super) async fn run_ledger_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "ledger",
        "recorded_mutation_fields_preserved",
        recorded_mutation_fields_preserved(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "missing_mutation_returns_none",
        missing_mutation_returns_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "duplicate_across_snapshots_rejected",
        duplicate_across_snapshots_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "duplicate_within_snapshot_rejected",
        duplicate_within_snapshot_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "same_mutation_id_on_other_endpoint_independent",
        same_mutation_id_on_other_endpoint_independent(factory).await,
    ));

    results
}

async fn record<S: AssessmentStorage>(
    s: &S,
    endpoint: &str,
    mutation_id: &str,
    fingerprint: &str,
) -> Result<(), StorageError> {
    let mut snap = s.begin_snapshot().await?;
    match s
        .insert_mutation(&mut snap, make_mutation(endpoint, mutation_id, fingerprint))
        .await
    {
        Ok(()) => s.commit_snapshot(snap).await,
        Err(e) => {
            let _ = s.abort_snapshot(snap).await;
            Err(e)
        }
    }
}

async fn recorded_mutation_fields_preserved<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    record(&s, "/answers", "m-1", "fp-1")
        .await
        .map_err(|e| e.to_string())?;

    let row = s
        .get_mutation("/answers", "m-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("ledger row missing")?;
    if row != make_mutation("/answers", "m-1", "fp-1") {
        return Err(format!("fields not preserved: {:?}", row));
    }
    Ok(())
}

async fn missing_mutation_returns_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_mutation("/answers", "never").await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {:?}", other)),
    }
}

/// A committed row is never replaced by a later insert of the same key.
async fn duplicate_across_snapshots_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    record(&s, "/answers", "m-1", "fp-1")
        .await
        .map_err(|e| e.to_string())?;

    match record(&s, "/answers", "m-1", "fp-2").await {
        Err(StorageError::DuplicateMutation {
            endpoint,
            mutation_id,
        }) if endpoint == "/answers" && mutation_id == "m-1" => {}
        other => return Err(format!("expected DuplicateMutation, got {:?}", other)),
    }

    let row = s
        .get_mutation("/answers", "m-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("ledger row missing")?;
    if row.fingerprint != "fp-1" {
        return Err(format!("row overwritten with {}", row.fingerprint));
    }
    Ok(())
}

async fn duplicate_within_snapshot_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_mutation(&mut snap, make_mutation("/answers", "m-1", "fp-1"))
        .await
        .map_err(|e| e.to_string())?;
    let second = s
        .insert_mutation(&mut snap, make_mutation("/answers", "m-1", "fp-2"))
        .await;
    let outcome = match second {
        Ok(()) => s.commit_snapshot(snap).await,
        Err(e) => {
            let _ = s.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::DuplicateMutation { .. }) => Ok(()),
        other => Err(format!("expected DuplicateMutation, got {:?}", other)),
    }
}

async fn same_mutation_id_on_other_endpoint_independent<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    record(&s, "/answers", "m-1", "fp-1")
        .await
        .map_err(|e| e.to_string())?;
    record(&s, "/validate", "m-1", "fp-2")
        .await
        .map_err(|e| format!("second endpoint rejected: {e}"))?;

    let a = s
        .get_mutation("/answers", "m-1")
        .await
        .map_err(|e| e.to_string())?;
    let b = s
        .get_mutation("/validate", "m-1")
        .await
        .map_err(|e| e.to_string())?;
    match (a, b) {
        (Some(a), Some(b)) if a.fingerprint == "fp-1" && b.fingerprint == "fp-2" => Ok(()),
        other => Err(format!("unexpected rows: {:?}", other)),
    }
}
