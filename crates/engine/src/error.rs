use intake_storage::StorageError;

use crate::funnel::StepDescriptor;

/// Coarse classification used by transports to pick a status code and by
/// the gateway to decide whether a failure may be retried under the same
/// mutation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or unknown input. Fixed by the client, never retried as-is.
    ClientInput,
    /// The caller may not act on this assessment.
    Ownership,
    /// The request is well-formed but not legal in the current progression state.
    StateMachine,
    /// A mutation id was reused with a different payload.
    PayloadConflict,
    /// Store or infrastructure failure. Retried with the same mutation id.
    Infrastructure,
}

/// Every failure the engine surfaces. Each variant has a stable
/// machine-readable [`code`](EngineError::code).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("funnel '{slug}' does not exist")]
    FunnelNotFound { slug: String },

    #[error("funnel '{slug}' is not configured: {reason}")]
    FunnelNotConfigured { slug: String, reason: String },

    #[error("assessment '{assessment_id}' not found")]
    AssessmentNotFound { assessment_id: String },

    #[error("assessment '{assessment_id}' is already completed")]
    AssessmentCompleted { assessment_id: String },

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("question '{question_id}' does not belong to funnel '{funnel_slug}'")]
    QuestionNotFound {
        question_id: String,
        funnel_slug: String,
    },

    #[error("invalid answer: {reason}")]
    InvalidAnswer { reason: String },

    #[error("invalid request: {reason}")]
    InvalidInput { reason: String },

    #[error("step '{step_id}' not found")]
    StepNotFound { step_id: String },

    #[error("step '{step_id}' belongs to funnel '{owner_slug}', not '{funnel_slug}'")]
    StepForeignToFunnel {
        step_id: String,
        funnel_slug: String,
        owner_slug: String,
    },

    #[error("step '{requested_step_id}' is not the current step '{}'", .current_step.id)]
    SkipPrevented {
        requested_step_id: String,
        current_step: Box<StepDescriptor>,
    },

    #[error("current step '{step_id}' of assessment '{assessment_id}' is not in its funnel")]
    CurrentStepNotFound {
        assessment_id: String,
        step_id: String,
    },

    #[error("assessment '{assessment_id}' was advanced concurrently; re-fetch and retry")]
    StalePointer { assessment_id: String },

    #[error("mutation '{mutation_id}' on {endpoint} was already used with a different payload")]
    PayloadConflict {
        endpoint: String,
        mutation_id: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::FunnelNotFound { .. } => "funnel-not-found",
            EngineError::FunnelNotConfigured { .. } => "funnel-not-configured",
            EngineError::AssessmentNotFound { .. } => "assessment-not-found",
            EngineError::AssessmentCompleted { .. } => "assessment-completed",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::QuestionNotFound { .. } => "question-not-found",
            EngineError::InvalidAnswer { .. } => "invalid-answer",
            EngineError::InvalidInput { .. } => "invalid-input",
            EngineError::StepNotFound { .. } => "step-not-found",
            EngineError::StepForeignToFunnel { .. } => "step-foreign-to-funnel",
            EngineError::SkipPrevented { .. } => "skip-prevented",
            EngineError::CurrentStepNotFound { .. } => "current-step-not-found",
            EngineError::StalePointer { .. } => "stale-pointer",
            EngineError::PayloadConflict { .. } => "payload-conflict",
            EngineError::StoreUnavailable(_) => "store-unavailable",
            EngineError::Internal(_) => "internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::FunnelNotFound { .. }
            | EngineError::FunnelNotConfigured { .. }
            | EngineError::AssessmentNotFound { .. }
            | EngineError::QuestionNotFound { .. }
            | EngineError::InvalidAnswer { .. }
            | EngineError::InvalidInput { .. }
            | EngineError::StepNotFound { .. } => ErrorCategory::ClientInput,
            EngineError::Forbidden { .. } => ErrorCategory::Ownership,
            EngineError::AssessmentCompleted { .. }
            | EngineError::StepForeignToFunnel { .. }
            | EngineError::SkipPrevented { .. }
            | EngineError::CurrentStepNotFound { .. }
            | EngineError::StalePointer { .. } => ErrorCategory::StateMachine,
            EngineError::PayloadConflict { .. } => ErrorCategory::PayloadConflict,
            EngineError::StoreUnavailable(_) | EngineError::Internal(_) => {
                ErrorCategory::Infrastructure
            }
        }
    }

    /// Whether the client may resend the identical request (same mutation id).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable(_) | EngineError::StalePointer { .. }
        )
    }

    /// Structured detail for clients that need to resynchronize.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EngineError::SkipPrevented { current_step, .. } => {
                Some(serde_json::json!({ "current_step": current_step }))
            }
            EngineError::StepForeignToFunnel { owner_slug, .. } => {
                Some(serde_json::json!({ "owner_funnel": owner_slug }))
            }
            EngineError::CurrentStepNotFound { step_id, .. } => {
                Some(serde_json::json!({ "stored_step_id": step_id }))
            }
            _ => None,
        }
    }
}

/// Default classification of storage failures. Call sites with more context
/// (the answer writer, the gateway) classify before falling back to this.
impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AssessmentNotFound { assessment_id } => {
                EngineError::AssessmentNotFound { assessment_id }
            }
            StorageError::ConcurrentConflict { assessment_id, .. } => {
                EngineError::StalePointer { assessment_id }
            }
            StorageError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            other => EngineError::Internal(other.to_string()),
        }
    }
}
