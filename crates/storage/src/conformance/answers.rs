//! Answer upsert conformance tests.

use std::future::Future;

use rust_decimal::Decimal;

use super::{make_answer, seed_assessment, TestResult};
use crate::{AssessmentStorage, StorageError};

pub(super) async fn run_answer_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "answers",
        "upsert_inserts_new_answer",
        upsert_inserts_new_answer(factory).await,
    ));
    results.push(TestResult::from_result(
        "answers",
        "upsert_same_question_overwrites",
        upsert_same_question_overwrites(factory).await,
    ));
    results.push(TestResult::from_result(
        "answers",
        "upsert_twice_in_one_snapshot_keeps_one_row",
        upsert_twice_in_one_snapshot_keeps_one_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "answers",
        "upsert_for_missing_assessment_is_foreign_key",
        upsert_for_missing_assessment_is_foreign_key(factory).await,
    ));
    results.push(TestResult::from_result(
        "answers",
        "answers_scoped_to_assessment",
        answers_scoped_to_assessment(factory).await,
    ));

    results
}

async fn upsert_inserts_new_answer<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let stored = s
        .upsert_answer(&mut snap, make_answer("ans-1", "a-1", "q1", 3))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if stored.id != "ans-1" || stored.value != Decimal::from(3) {
        return Err(format!("unexpected stored row: {:?}", stored));
    }
    let answers = s.list_answers("a-1").await.map_err(|e| e.to_string())?;
    if answers.len() != 1 || answers[0].raw_value != Some(serde_json::json!(3)) {
        return Err(format!("unexpected answers: {:?}", answers));
    }
    Ok(())
}

/// Second write to the same (assessment, question) replaces the first and
/// keeps the original row id.
async fn upsert_same_question_overwrites<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    for (row_id, value) in [("ans-1", 1), ("ans-2", 4)] {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.upsert_answer(&mut snap, make_answer(row_id, "a-1", "q1", value))
            .await
            .map_err(|e| e.to_string())?;
        s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    }

    let answers = s.list_answers("a-1").await.map_err(|e| e.to_string())?;
    if answers.len() != 1 {
        return Err(format!("expected exactly 1 row, got {}", answers.len()));
    }
    if answers[0].value != Decimal::from(4) {
        return Err(format!("expected value 4, got {}", answers[0].value));
    }
    if answers[0].id != "ans-1" {
        return Err(format!("row id changed to {}", answers[0].id));
    }
    Ok(())
}

async fn upsert_twice_in_one_snapshot_keeps_one_row<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-1", "a-1", "q1", 1))
        .await
        .map_err(|e| e.to_string())?;
    let second = s
        .upsert_answer(&mut snap, make_answer("ans-2", "a-1", "q1", 2))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if second.id != "ans-1" {
        return Err(format!("expected original row id, got {}", second.id));
    }
    let answers = s.list_answers("a-1").await.map_err(|e| e.to_string())?;
    if answers.len() != 1 || answers[0].value != Decimal::from(2) {
        return Err(format!("unexpected answers: {:?}", answers));
    }
    Ok(())
}

async fn upsert_for_missing_assessment_is_foreign_key<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .upsert_answer(&mut snap, make_answer("ans-1", "missing", "q1", 1))
        .await;
    let outcome = match result {
        Ok(_) => s.commit_snapshot(snap).await,
        Err(e) => {
            let _ = s.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::ForeignKey { key, .. }) if key == "missing" => Ok(()),
        other => Err(format!("expected ForeignKey, got {:?}", other)),
    }
}

async fn answers_scoped_to_assessment<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_assessment(&s, "a-1").await?;
    seed_assessment(&s, "a-2").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-1", "a-1", "q1", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-2", "a-2", "q1", 2))
        .await
        .map_err(|e| e.to_string())?;
    s.upsert_answer(&mut snap, make_answer("ans-3", "a-2", "q2", 3))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let first = s.list_answers("a-1").await.map_err(|e| e.to_string())?;
    let second = s.list_answers("a-2").await.map_err(|e| e.to_string())?;
    if first.len() != 1 || second.len() != 2 {
        return Err(format!(
            "expected 1 and 2 answers, got {} and {}",
            first.len(),
            second.len()
        ));
    }
    Ok(())
}
