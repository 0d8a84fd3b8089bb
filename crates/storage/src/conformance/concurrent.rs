use std::future::Future;
use std::sync::Arc;

use super::{make_mutation, seed_assessment, TestResult};
use crate::{AssessmentStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_ledger_inserts_exactly_one_wins",
        concurrent_ledger_inserts_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_pointer_updates_exactly_one_wins",
        concurrent_pointer_updates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_different_assessments_all_succeed",
        concurrent_updates_different_assessments_all_succeed(factory).await,
    ));

    results
}

fn tally(outcomes: Vec<bool>) -> Result<(), String> {
    let winners = outcomes.iter().filter(|won| **won).count();
    let losers = outcomes.len() - winners;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    Ok(())
}

// ── Concurrent ledger claims: exactly one wins ──────────────────────────────

/// N tasks each try to record the same (endpoint, mutation id). Exactly one
/// commit succeeds; the rest must see DuplicateMutation at insert or commit.
async fn concurrent_ledger_inserts_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let claim = s
                .insert_mutation(
                    &mut snap,
                    make_mutation("/answers", "m-race", &format!("fp-{i}")),
                )
                .await;
            let outcome = match claim {
                Ok(()) => s.commit_snapshot(snap).await,
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            };
            match outcome {
                Ok(()) => Ok(true),
                Err(StorageError::DuplicateMutation { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(
            handle
                .await
                .map_err(|e| format!("task panic: {e}"))?
                .map_err(|e: StorageError| format!("storage error: {e}"))?,
        );
    }
    tally(outcomes)?;

    if storage
        .get_mutation("/answers", "m-race")
        .await
        .map_err(|e| e.to_string())?
        .is_none()
    {
        return Err("no ledger row after race".to_string());
    }
    Ok(())
}

// ── Concurrent pointer moves: exactly one wins ──────────────────────────────

/// N tasks each try to move the pointer from version 0. Exactly one commit
/// succeeds; the rest must get ConcurrentConflict.
async fn concurrent_pointer_updates_exactly_one_wins<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_assessment(storage.as_ref(), "a-1").await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let update = s
                .update_current_step(&mut snap, "a-1", 0, &format!("s{}", i + 1))
                .await;
            let outcome = match update {
                Ok(_) => s.commit_snapshot(snap).await,
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            };
            match outcome {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(
            handle
                .await
                .map_err(|e| format!("task panic: {e}"))?
                .map_err(|e: StorageError| format!("storage error: {e}"))?,
        );
    }
    tally(outcomes)?;

    let rec = storage
        .get_assessment("a-1")
        .await
        .map_err(|e| e.to_string())?;
    if rec.version != 1 {
        return Err(format!("expected version 1 after race, got {}", rec.version));
    }
    Ok(())
}

// ── Uncontended updates: all succeed ────────────────────────────────────────

async fn concurrent_updates_different_assessments_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_assessment(storage.as_ref(), &format!("a-{i}")).await?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("a-{i}");
            let mut snap = s.begin_snapshot().await?;
            s.update_current_step(&mut snap, &id, 0, "s1").await?;
            s.insert_mutation(&mut snap, make_mutation("/validate", &id, "fp"))
                .await?;
            s.commit_snapshot(snap).await
        }));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("false conflict: {e}"))?;
    }
    Ok(())
}
