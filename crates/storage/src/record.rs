use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle status of an assessment. Only `InProgress -> Completed` is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    InProgress,
    Completed,
}

impl AssessmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentStatus::InProgress => "in_progress",
            AssessmentStatus::Completed => "completed",
        }
    }
}

/// One run of a funnel by one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub id: String,
    pub patient_id: String,
    pub funnel_slug: String,
    /// Foreign key into the legacy relational funnel tables. `None` means the
    /// funnel is served from a versioned manifest document.
    pub legacy_funnel_id: Option<String>,
    pub status: AssessmentStatus,
    pub current_step_id: Option<String>,
    /// Optimistic concurrency counter, starts at 0.
    pub version: i64,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub started_at: String,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// A stored answer, unique per (assessment, question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: String,
    pub assessment_id: String,
    pub question_id: String,
    /// Normalized numeric value.
    pub value: Decimal,
    /// Original structured value, kept for manifest funnels with richer payloads.
    pub raw_value: Option<serde_json::Value>,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub answered_at: String,
}

/// Write-once ledger entry keyed by (endpoint, mutation id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub endpoint: String,
    pub mutation_id: String,
    /// Lowercase hex SHA-256 of the canonical request payload.
    pub fingerprint: String,
    pub response: serde_json::Value,
    pub status_code: u16,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub created_at: String,
}
