//! Answer Writer: normalizes one raw answer and upserts it.

use std::str::FromStr;

use intake_storage::{now_rfc3339, AnswerRecord, AssessmentStorage, StorageError};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::EngineError;

/// Largest accepted raw answer, measured as serialized JSON.
pub const MAX_RAW_ANSWER_BYTES: usize = 16 * 1024;

/// A raw answer reduced to the numeric value used for scoring, with the
/// original structured value kept alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedValue {
    pub value: Decimal,
    pub raw: Option<Value>,
}

/// Normalize a raw JSON answer.
///
/// Booleans become 0 or 1, numbers and numeric strings become decimals, and
/// everything else, `null` included, scores 0. Oversized values and numbers
/// outside the decimal range are rejected.
pub fn normalize(raw: &Value) -> Result<NormalizedValue, EngineError> {
    let size = serde_json::to_vec(raw)
        .map_err(|e| EngineError::InvalidAnswer {
            reason: format!("answer is not serializable: {e}"),
        })?
        .len();
    if size > MAX_RAW_ANSWER_BYTES {
        return Err(EngineError::InvalidAnswer {
            reason: format!("answer is {size} bytes, limit is {MAX_RAW_ANSWER_BYTES}"),
        });
    }

    let value = match raw {
        Value::Bool(b) => Decimal::from(u8::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Decimal::from(i)
            } else if let Some(u) = n.as_u64() {
                Decimal::from(u)
            } else {
                parse_decimal(&n.to_string()).ok_or_else(|| EngineError::InvalidAnswer {
                    reason: format!("number {n} is outside the supported range"),
                })?
            }
        }
        Value::String(s) => parse_decimal(s.trim()).unwrap_or(Decimal::ZERO),
        Value::Null | Value::Array(_) | Value::Object(_) => Decimal::ZERO,
    };

    Ok(NormalizedValue {
        value,
        raw: Some(raw.clone()),
    })
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Upsert the answer for `(assessment_id, question_id)` inside `snapshot`.
///
/// The caller has already checked that the question belongs to the
/// assessment's funnel.
pub async fn save<S: AssessmentStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    assessment_id: &str,
    question_id: &str,
    raw: &Value,
) -> Result<AnswerRecord, EngineError> {
    let normalized = normalize(raw)?;
    let record = AnswerRecord {
        id: uuid::Uuid::new_v4().to_string(),
        assessment_id: assessment_id.to_string(),
        question_id: question_id.to_string(),
        value: normalized.value,
        raw_value: normalized.raw,
        answered_at: now_rfc3339(),
    };

    storage
        .upsert_answer(snapshot, record)
        .await
        .map_err(|e| match e {
            StorageError::ForeignKey { .. } => EngineError::AssessmentNotFound {
                assessment_id: assessment_id.to_string(),
            },
            StorageError::Constraint(reason) => EngineError::InvalidAnswer { reason },
            other => other.into(),
        })
}
