//! Route handlers: health, start, resume, save answer, validate step.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use intake_engine::{Actor, EngineError, ErrorCategory, Replayed};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::json_error;
use super::state::AppState;

/// Set on responses served from the mutation ledger.
pub(crate) const REPLAYED_HEADER: &str = "idempotent-replayed";

#[derive(Debug, Deserialize)]
struct StartRequest {
    funnel_slug: String,
    #[serde(default)]
    mutation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SaveAnswerRequest {
    question_id: String,
    value: serde_json::Value,
    mutation_id: String,
}

#[derive(Debug, Deserialize)]
struct ValidateStepRequest {
    mutation_id: String,
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not-found", "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// POST /assessments
pub(crate) async fn handle_start_assessment(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let request: StartRequest = match parse_body(body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    run_mutation(
        state.request_timeout,
        state.engine.start_assessment(
            &actor,
            &request.funnel_slug,
            request.mutation_id.as_deref(),
        ),
    )
    .await
}

/// GET /assessments/{id}
pub(crate) async fn handle_resume(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(assessment_id): Path<String>,
) -> Response {
    match tokio::time::timeout(
        state.request_timeout,
        state.engine.resume(&actor, &assessment_id),
    )
    .await
    {
        Ok(Ok(resume)) => (StatusCode::OK, Json(resume)).into_response(),
        Ok(Err(e)) => engine_error(&e),
        Err(_) => timed_out(state.request_timeout),
    }
}

/// POST /assessments/{id}/answers
pub(crate) async fn handle_save_answer(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(assessment_id): Path<String>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let request: SaveAnswerRequest = match parse_body(body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    run_mutation(
        state.request_timeout,
        state.engine.save_answer(
            &actor,
            &assessment_id,
            &request.question_id,
            request.value,
            &request.mutation_id,
        ),
    )
    .await
}

/// POST /assessments/{id}/steps/{step_id}/validate
pub(crate) async fn handle_validate_step(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path((assessment_id, step_id)): Path<(String, String)>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let request: ValidateStepRequest = match parse_body(body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    run_mutation(
        state.request_timeout,
        state
            .engine
            .validate_step(&actor, &assessment_id, &step_id, &request.mutation_id),
    )
    .await
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Decode a request body, answering unreadable or mistyped bodies with the
/// structured `invalid-input` error instead of axum's plain-text rejection.
fn parse_body<T: DeserializeOwned>(
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<T, Response> {
    let Json(body) = body.map_err(|rejection| {
        json_error(
            rejection.status(),
            "invalid-input",
            &format!("unreadable request body: {}", rejection.body_text()),
        )
        .into_response()
    })?;
    serde_json::from_value(body).map_err(|e| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid-input",
            &format!("invalid request body: {}", e),
        )
        .into_response()
    })
}

/// Run one mutation under the request timeout. A mutation that committed
/// after the deadline is still replayed when the client retries.
async fn run_mutation<T, F>(timeout: Duration, mutation: F) -> Response
where
    F: Future<Output = Result<Replayed<T>, EngineError>>,
{
    match tokio::time::timeout(timeout, mutation).await {
        Ok(Ok(result)) => mutation_response(result),
        Ok(Err(e)) => engine_error(&e),
        Err(_) => timed_out(timeout),
    }
}

fn mutation_response<T>(result: Replayed<T>) -> Response {
    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(result.body)).into_response();
    if result.replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}

fn timed_out(timeout: Duration) -> Response {
    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
    json_error(
        StatusCode::GATEWAY_TIMEOUT,
        "timeout",
        "request timed out; retry with the same mutation_id",
    )
    .into_response()
}

pub(crate) fn status_for(err: &EngineError) -> StatusCode {
    match err.category() {
        ErrorCategory::ClientInput => match err {
            EngineError::FunnelNotFound { .. }
            | EngineError::AssessmentNotFound { .. }
            | EngineError::QuestionNotFound { .. }
            | EngineError::StepNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidAnswer { .. } | EngineError::FunnelNotConfigured { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::BAD_REQUEST,
        },
        ErrorCategory::Ownership => StatusCode::FORBIDDEN,
        ErrorCategory::StateMachine | ErrorCategory::PayloadConflict => StatusCode::CONFLICT,
        ErrorCategory::Infrastructure => match err {
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn engine_error(err: &EngineError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!(code = err.code(), error = %err, "request failed");
    } else {
        tracing::debug!(code = err.code(), error = %err, "request rejected");
    }

    let mut error = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(details) = err.details() {
        error["details"] = details;
    }
    if err.is_retryable() {
        error["retryable"] = serde_json::Value::Bool(true);
    }
    (status, Json(serde_json::json!({ "error": error }))).into_response()
}
