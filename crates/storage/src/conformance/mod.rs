//! Conformance test suite for `AssessmentStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `AssessmentStorage` implementation can run to verify correctness. The
//! suite covers:
//!
//! - **Snapshot isolation**: uncommitted writes invisible, committed writes visible
//! - **Assessments**: insertion, duplicate detection, OCC on the step pointer
//! - **Answers**: upsert semantics and the assessment foreign key
//! - **Ledger**: write-once rows and key uniqueness across snapshots
//! - **Concurrency**: exactly one winner for contended keys and versions
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use intake_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod answers;
mod assessment;
mod concurrent;
mod ledger;
mod snapshot;

use std::fmt;
use std::future::Future;

use rust_decimal::Decimal;

use crate::record::{AnswerRecord, AssessmentRecord, AssessmentStatus, MutationRecord};
use crate::AssessmentStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "snapshot", "ledger").
    pub category: String,
    /// Test name (e.g. "duplicate_mutation_rejected_at_commit").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: AssessmentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(assessment::run_assessment_tests(&factory).await);
    results.extend(answers::run_answer_tests(&factory).await);
    results.extend(ledger::run_ledger_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_assessment(id: &str) -> AssessmentRecord {
    AssessmentRecord {
        id: id.to_string(),
        patient_id: "patient-1".to_string(),
        funnel_slug: "stress".to_string(),
        legacy_funnel_id: None,
        status: AssessmentStatus::InProgress,
        current_step_id: Some("s0".to_string()),
        version: 0,
        started_at: "2025-01-01T00:00:00Z".to_string(),
        updated_at: "2025-01-01T00:00:00Z".to_string(),
        completed_at: None,
    }
}

fn make_answer(id: &str, assessment_id: &str, question_id: &str, value: i64) -> AnswerRecord {
    AnswerRecord {
        id: id.to_string(),
        assessment_id: assessment_id.to_string(),
        question_id: question_id.to_string(),
        value: Decimal::from(value),
        raw_value: Some(serde_json::json!(value)),
        answered_at: "2025-01-01T00:00:30Z".to_string(),
    }
}

fn make_mutation(endpoint: &str, mutation_id: &str, fingerprint: &str) -> MutationRecord {
    MutationRecord {
        endpoint: endpoint.to_string(),
        mutation_id: mutation_id.to_string(),
        fingerprint: fingerprint.to_string(),
        response: serde_json::json!({"ok": true, "fingerprint": fingerprint}),
        status_code: 200,
        created_at: "2025-01-01T00:01:00Z".to_string(),
    }
}

/// Insert and commit an assessment in its own snapshot.
async fn seed_assessment<S: AssessmentStorage>(s: &S, id: &str) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_assessment(&mut snap, make_assessment(id))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}
