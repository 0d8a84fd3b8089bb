//! `intake serve` -- HTTP JSON API over the assessment progression engine.
//!
//! Endpoints:
//! - GET  /health                                    - Server status (no identity needed)
//! - POST /assessments                               - Start an assessment
//! - GET  /assessments/{id}                          - Resume state
//! - POST /assessments/{id}/answers                  - Save one answer
//! - POST /assessments/{id}/steps/{step_id}/validate - Validate the current step
//!
//! Mutations replayed from the ledger carry `Idempotent-Replayed: true`.
//! Errors are `{"error": {"code", "message", "details"?}}`.

mod handlers;
mod middleware;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use intake_engine::{Engine, TracingAuditSink};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use self::handlers::{
    handle_health, handle_not_found, handle_resume, handle_save_answer, handle_start_assessment,
    handle_validate_step,
};
use self::middleware::identity_middleware;
use self::state::AppState;
use crate::seed;

/// Maximum request body size: 64 KB. Answers themselves are capped at 16 KB.
const MAX_BODY_SIZE: usize = 64 * 1024;

const DEFAULT_PORT: u16 = 8080;

/// Default per-request timeout: 10 seconds.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Construct a JSON error response with the given status code, code and message.
fn json_error(status: StatusCode, code: &str, message: &str) -> impl IntoResponse {
    (
        status,
        Json(serde_json::json!({"error": {"code": code, "message": message}})),
    )
}

/// Server settings after applying environment fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServeConfig {
    pub(crate) port: u16,
    pub(crate) funnels: Option<PathBuf>,
    pub(crate) request_timeout: Duration,
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    pub(crate) tls_cert: Option<PathBuf>,
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    pub(crate) tls_key: Option<PathBuf>,
}

impl ServeConfig {
    /// Command-line flags win; `INTAKE_PORT`, `INTAKE_FUNNELS` and
    /// `INTAKE_REQUEST_TIMEOUT_MS` fill in what was not given.
    pub(crate) fn resolve(
        port: Option<u16>,
        funnels: Option<PathBuf>,
        timeout_ms: Option<u64>,
        tls_cert: Option<PathBuf>,
        tls_key: Option<PathBuf>,
    ) -> Self {
        Self::resolve_with(port, funnels, timeout_ms, tls_cert, tls_key, |key| {
            std::env::var(key).ok()
        })
    }

    fn resolve_with(
        port: Option<u16>,
        funnels: Option<PathBuf>,
        timeout_ms: Option<u64>,
        tls_cert: Option<PathBuf>,
        tls_key: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let port = port
            .or_else(|| env("INTAKE_PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_PORT);
        let funnels = funnels.or_else(|| {
            env("INTAKE_FUNNELS")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });
        let timeout_ms = timeout_ms
            .or_else(|| env("INTAKE_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()))
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Self {
            port,
            funnels,
            request_timeout: Duration::from_millis(timeout_ms),
            tls_cert,
            tls_key,
        }
    }
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    // CORS: permissive; the upstream gateway owns origin policy.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/assessments", post(handle_start_assessment))
        .route("/assessments/{id}", get(handle_resume))
        .route("/assessments/{id}/answers", post(handle_save_answer))
        .route(
            "/assessments/{id}/steps/{step_id}/validate",
            post(handle_validate_step),
        )
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn(identity_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the HTTP server.
///
/// When TLS cert/key paths are provided, the server listens over HTTPS
/// using `axum-server` with rustls (requires the `tls` feature).
pub(crate) async fn start_server(config: ServeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = seed::load_storage(config.funnels.as_deref())?;
    let engine = Engine::new(Arc::new(storage), Arc::new(TracingAuditSink));
    let state = Arc::new(AppState {
        engine,
        request_timeout: config.request_timeout,
    });
    tracing::info!(
        timeout_ms = config.request_timeout.as_millis() as u64,
        "request timeout configured"
    );

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);

    #[cfg(feature = "tls")]
    if let (Some(cert_path), Some(key_path)) = (&config.tls_cert, &config.tls_key) {
        let tls =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
        let socket_addr: std::net::SocketAddr = addr.parse()?;
        tracing::info!("intake listening on https://{}", addr);
        axum_server::bind_rustls(socket_addr, tls)
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("intake listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let config = ServeConfig::resolve_with(None, None, None, None, None, no_env);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.funnels, None);
        assert_eq!(config.request_timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn env_fills_missing_flags() {
        let env = |key: &str| match key {
            "INTAKE_PORT" => Some("9100".to_string()),
            "INTAKE_FUNNELS" => Some("/etc/intake/funnels.json".to_string()),
            "INTAKE_REQUEST_TIMEOUT_MS" => Some("2500".to_string()),
            _ => None,
        };
        let config = ServeConfig::resolve_with(None, None, None, None, None, env);
        assert_eq!(config.port, 9100);
        assert_eq!(
            config.funnels,
            Some(PathBuf::from("/etc/intake/funnels.json"))
        );
        assert_eq!(config.request_timeout, Duration::from_millis(2500));

        let config =
            ServeConfig::resolve_with(Some(7000), None, Some(50), None, None, env);
        assert_eq!(config.port, 7000);
        assert_eq!(config.request_timeout, Duration::from_millis(50));
    }

    #[test]
    fn unparseable_env_falls_back_to_defaults() {
        let env = |key: &str| match key {
            "INTAKE_PORT" => Some("eighty".to_string()),
            "INTAKE_REQUEST_TIMEOUT_MS" => Some("0".to_string()),
            _ => None,
        };
        let config = ServeConfig::resolve_with(None, None, None, None, None, env);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.request_timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }
}
