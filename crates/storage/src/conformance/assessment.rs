//! Assessment row conformance tests: insertion, lookup errors, and the
//! version-checked pointer and status updates.

use std::future::Future;

use super::{make_assessment, seed_assessment, TestResult};
use crate::{AssessmentStatus, AssessmentStorage, StorageError};

pub(super) async fn run_assessment_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "assessment",
        "duplicate_insert_returns_already_exists",
        duplicate_insert_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "get_nonexistent_returns_not_found",
        get_nonexistent_returns_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "update_current_step_increments_version",
        update_current_step_increments_version(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "stale_version_returns_concurrent_conflict",
        stale_version_returns_concurrent_conflict(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "sequential_updates_increment_version",
        sequential_updates_increment_version(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "update_nonexistent_returns_not_found",
        update_nonexistent_returns_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "mark_completed_sets_status",
        mark_completed_sets_status(factory).await,
    ));
    results.push(TestResult::from_result(
        "assessment",
        "mark_completed_twice_rejected",
        mark_completed_twice_rejected(factory).await,
    ));

    results
}

async fn duplicate_insert_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.insert_assessment(&mut snap, make_assessment("a-1")).await;
    let outcome = match result {
        Ok(()) => s.commit_snapshot(snap).await,
        Err(e) => {
            let _ = s.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::AlreadyExists { assessment_id }) if assessment_id == "a-1" => Ok(()),
        other => Err(format!("expected AlreadyExists(a-1), got {:?}", other)),
    }
}

async fn get_nonexistent_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_assessment("missing").await {
        Err(StorageError::AssessmentNotFound { assessment_id }) if assessment_id == "missing" => {}
        other => return Err(format!("get: expected AssessmentNotFound, got {:?}", other)),
    }

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.get_assessment_for_update(&mut snap, "missing").await;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    match result {
        Err(StorageError::AssessmentNotFound { .. }) => Ok(()),
        other => Err(format!(
            "get_for_update: expected AssessmentNotFound, got {:?}",
            other
        )),
    }
}

async fn update_current_step_increments_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let new_version = s
        .update_current_step(&mut snap, "a-1", 0, "s1")
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if new_version != 1 {
        return Err(format!("expected returned version 1, got {new_version}"));
    }
    let rec = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    if rec.current_step_id.as_deref() != Some("s1") || rec.version != 1 {
        return Err(format!(
            "expected pointer s1 at version 1, got {:?} at {}",
            rec.current_step_id, rec.version
        ));
    }
    Ok(())
}

async fn stale_version_returns_concurrent_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.update_current_step(&mut snap, "a-1", 5, "s1").await;
    let outcome = match result {
        Ok(_) => s.commit_snapshot(snap).await,
        Err(e) => {
            let _ = s.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::ConcurrentConflict {
            assessment_id,
            expected_version,
        }) if assessment_id == "a-1" && expected_version == 5 => {}
        other => return Err(format!("expected ConcurrentConflict, got {:?}", other)),
    }

    let rec = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    if rec.current_step_id.as_deref() != Some("s0") {
        return Err("pointer moved despite conflict".to_string());
    }
    Ok(())
}

async fn sequential_updates_increment_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    for (expected, step) in [(0, "s1"), (1, "s2"), (2, "s3")] {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.update_current_step(&mut snap, "a-1", expected, step)
            .await
            .map_err(|e| format!("update at {expected}: {e}"))?;
        s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    }

    let rec = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    if rec.version != 3 || rec.current_step_id.as_deref() != Some("s3") {
        return Err(format!(
            "expected s3 at version 3, got {:?} at {}",
            rec.current_step_id, rec.version
        ));
    }
    Ok(())
}

async fn update_nonexistent_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.update_current_step(&mut snap, "missing", 0, "s1").await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AssessmentNotFound { .. }) => Ok(()),
        other => Err(format!("expected AssessmentNotFound, got {:?}", other)),
    }
}

async fn mark_completed_sets_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.mark_completed(&mut snap, "a-1", 0)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let rec = s.get_assessment("a-1").await.map_err(|e| e.to_string())?;
    if rec.status != AssessmentStatus::Completed {
        return Err(format!("expected completed, got {}", rec.status.as_str()));
    }
    if rec.completed_at.is_none() {
        return Err("completed_at not set".to_string());
    }
    Ok(())
}

async fn mark_completed_twice_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.mark_completed(&mut snap, "a-1", 0)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.mark_completed(&mut snap, "a-1", 1).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::Constraint(_)) => Ok(()),
        other => Err(format!("expected Constraint, got {:?}", other)),
    }
}
