//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! committed writes are visible, and aborted or losing snapshots leave
//! nothing behind.

use std::future::Future;

use super::{make_answer, make_assessment, make_mutation, seed_assessment, TestResult};
use crate::{AssessmentStorage, StorageError};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_assessment_invisible",
        uncommitted_assessment_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "committed_assessment_visible",
        committed_assessment_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "aborted_assessment_invisible",
        aborted_assessment_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "dropped_snapshot_discards_writes",
        dropped_snapshot_discards_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_pointer_update_invisible",
        uncommitted_pointer_update_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_reads_own_writes",
        snapshot_reads_own_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "multi_record_commit_all_visible",
        multi_record_commit_all_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "multi_record_abort_none_visible",
        multi_record_abort_none_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "losing_commit_applies_nothing",
        losing_commit_applies_nothing(factory).await,
    ));

    results
}

/// An inserted assessment is not readable outside the snapshot before commit.
async fn uncommitted_assessment_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_assessment(&mut snap, make_assessment("a-1"))
        .await
        .map_err(|e| e.to_string())?;

    let outside = s.get_assessment("a-1").await;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    match outside {
        Err(StorageError::AssessmentNotFound { .. }) => Ok(()),
        other => Err(format!("expected AssessmentNotFound, got {:?}", other)),
    }
}

async fn committed_assessment_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;
    let rec = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    if rec != make_assessment("a-1") {
        return Err(format!("fields not preserved: {:?}", rec));
    }
    Ok(())
}

async fn aborted_assessment_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_assessment(&mut snap, make_assessment("a-1"))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    match s.get_assessment("a-1").await {
        Err(StorageError::AssessmentNotFound { .. }) => Ok(()),
        other => Err(format!("expected AssessmentNotFound, got {:?}", other)),
    }
}

/// Dropping a snapshot without commit must behave like abort.
async fn dropped_snapshot_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.insert_assessment(&mut snap, make_assessment("a-1"))
            .await
            .map_err(|e| e.to_string())?;
        s.insert_mutation(&mut snap, make_mutation("/answers", "m-1", "fp"))
            .await
            .map_err(|e| e.to_string())?;
    }

    if s.get_assessment("a-1").await.is_ok() {
        return Err("assessment visible after drop".to_string());
    }
    let ledger = s
        .get_mutation("/answers", "m-1")
        .await
        .map_err(|e| e.to_string())?;
    if ledger.is_some() {
        return Err("ledger row visible after drop".to_string());
    }
    Ok(())
}

async fn uncommitted_pointer_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_current_step(&mut snap, "a-1", 0, "s1")
        .await
        .map_err(|e| e.to_string())?;

    let outside = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    if outside.current_step_id.as_deref() != Some("s0") || outside.version != 0 {
        return Err(format!(
            "uncommitted update leaked: pointer {:?}, version {}",
            outside.current_step_id, outside.version
        ));
    }
    Ok(())
}

async fn snapshot_reads_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_assessment(&mut snap, make_assessment("a-1"))
        .await
        .map_err(|e| e.to_string())?;
    s.update_current_step(&mut snap, "a-1", 0, "s1")
        .await
        .map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-1", "a-1", "q1", 2))
        .await
        .map_err(|e| e.to_string())?;

    let rec = s
        .get_assessment_for_update(&mut snap, "a-1")
        .await
        .map_err(|e| e.to_string())?;
    let answers = s
        .load_answers(&mut snap, "a-1")
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if rec.current_step_id.as_deref() != Some("s1") || rec.version != 1 {
        return Err(format!(
            "expected pointer s1 at version 1, got {:?} at {}",
            rec.current_step_id, rec.version
        ));
    }
    if answers.len() != 1 {
        return Err(format!("expected 1 pending answer, got {}", answers.len()));
    }
    Ok(())
}

/// Assessment + answer + ledger row in one snapshot, committed together.
async fn multi_record_commit_all_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_assessment(&mut snap, make_assessment("a-1"))
        .await
        .map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-1", "a-1", "q1", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_mutation(&mut snap, make_mutation("/answers", "m-1", "fp"))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    let answers = s.list_answers("a-1").await.map_err(|e| e.to_string())?;
    if answers.len() != 1 {
        return Err(format!("expected 1 answer, got {}", answers.len()));
    }
    let ledger = s
        .get_mutation("/answers", "m-1")
        .await
        .map_err(|e| e.to_string())?;
    if ledger.is_none() {
        return Err("ledger row missing after commit".to_string());
    }
    Ok(())
}

async fn multi_record_abort_none_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_current_step(&mut snap, "a-1", 0, "s1")
        .await
        .map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-1", "a-1", "q1", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_mutation(&mut snap, make_mutation("/validate", "m-1", "fp"))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    let rec = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    if rec.current_step_id.as_deref() != Some("s0") {
        return Err(format!("pointer moved after abort: {:?}", rec.current_step_id));
    }
    if !s
        .list_answers("a-1")
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("answer visible after abort".to_string());
    }
    if s.get_mutation("/validate", "m-1")
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("ledger row visible after abort".to_string());
    }
    Ok(())
}

/// Two snapshots claim the same ledger key. The second to commit loses and
/// none of its other writes may become visible.
async fn losing_commit_applies_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut loser = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_answer(&mut loser, make_answer("ans-loser", "a-1", "q1", 9))
        .await
        .map_err(|e| e.to_string())?;

    let mut winner = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_mutation(&mut winner, make_mutation("/answers", "m-1", "fp-winner"))
        .await
        .map_err(|e| format!("winner insert: {e}"))?;
    s.commit_snapshot(winner)
        .await
        .map_err(|e| format!("winner commit: {e}"))?;

    // The uniqueness violation may surface at insert or at commit.
    let outcome = match s
        .insert_mutation(&mut loser, make_mutation("/answers", "m-1", "fp-loser"))
        .await
    {
        Ok(()) => s.commit_snapshot(loser).await,
        Err(e) => {
            let _ = s.abort_snapshot(loser).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::DuplicateMutation { .. }) => {}
        other => return Err(format!("expected DuplicateMutation, got {:?}", other)),
    }

    if !s
        .list_answers("a-1")
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("losing snapshot's answer became visible".to_string());
    }
    let row = s
        .get_mutation("/answers", "m-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("ledger row missing")?;
    if row.fingerprint != "fp-winner" {
        return Err(format!("ledger row overwritten: {}", row.fingerprint));
    }
    Ok(())
}
