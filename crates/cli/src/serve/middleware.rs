//! HTTP middleware: caller identity.
//!
//! Authentication happens upstream. The gateway in front of this service
//! forwards the resolved caller as `X-Patient-Id` and `X-Role` headers; this
//! layer turns them into an [`Actor`] request extension.

use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use intake_engine::{Actor, Role};

pub(crate) const PATIENT_ID_HEADER: &str = "x-patient-id";
pub(crate) const ROLE_HEADER: &str = "x-role";

/// Resolve the caller. Every route except /health requires `X-Patient-Id`;
/// `X-Role` defaults to `patient`.
pub(crate) async fn identity_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let patient_id = request
        .headers()
        .get(PATIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let Some(patient_id) = patient_id else {
        return super::json_error(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "missing X-Patient-Id header",
        )
        .into_response();
    };

    let role = match request
        .headers()
        .get(ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        None => Role::Patient,
        Some(raw) => match raw.parse::<Role>() {
            Ok(role) => role,
            Err(e) => {
                return super::json_error(StatusCode::UNAUTHORIZED, "unauthenticated", &e)
                    .into_response()
            }
        },
    };

    request.extensions_mut().insert(Actor { patient_id, role });
    next.run(request).await
}
