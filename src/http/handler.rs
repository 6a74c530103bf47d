//! Main axum router and HTTP request handlers for the package proxy.
//!
//! Routes:
//! - `GET  /api/v1/{refraction}/{*path}` - resolve and stream an artifact
//!   (a HEAD request runs the existence fan-out without downloading)
//! - `GET  /healthz`                     - health check
//! - `GET  /metrics`                     - Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{debug, error, instrument, warn};

use crate::error::ResolveError;
use crate::metrics::{Metrics, Outcome, OutcomeLabels, RefractionLabels};
use crate::request::{AuthMode, RequestContext};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/{refraction}/{*path}", get(handle_artifact))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET|HEAD /api/v1/{refraction}/{*path}`
///
/// Builds the request context from the caller's credential headers, runs the
/// resolution through the named refraction, and streams the winning artifact.
/// HEAD stops after the existence fan-out.
#[instrument(skip(state, method, headers), fields(%refraction, %path))]
async fn handle_artifact(
    State(state): State<Arc<AppState>>,
    Path((refraction, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let _active = ActiveRequest::begin(&state.metrics.metrics);

    let mut ctx = extract_context(&headers, &state.config.partition.trigger_header);
    // Dropping the handler future (client gone) cancels the in-flight fan-out.
    let _cancel_on_drop = ctx.cancel.clone().drop_guard();

    let started = Instant::now();
    let result = if method == Method::HEAD {
        match state.resolver.probe(&refraction, &path, &ctx).await {
            Ok(member) => {
                debug!(member = %member.name(), "artifact present");
                Ok(StatusCode::OK.into_response())
            }
            Err(err) => Err(err),
        }
    } else {
        state
            .resolver
            .resolve(&refraction, &path, &mut ctx)
            .await
            .map(|stream| {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    Body::from_stream(stream),
                )
                    .into_response()
            })
    };

    let metrics = &state.metrics.metrics;
    metrics
        .resolve_duration_seconds
        .get_or_create(&RefractionLabels {
            refraction: refraction.clone(),
        })
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            metrics
                .resolve_total
                .get_or_create(&OutcomeLabels {
                    outcome: Outcome::Success,
                })
                .inc();
            response
        }
        Err(err) => {
            metrics
                .resolve_total
                .get_or_create(&OutcomeLabels {
                    outcome: Outcome::from(&err),
                })
                .inc();
            resolve_error_response(&refraction, &path, err)
        }
    }
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        storage: state.storage.clone(),
        resolver: state.resolver.clone(),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Derive the request context from the caller's credential headers.
///
/// `Authorization: Bearer <token>` is stored bare (the upstream client
/// re-attaches the scheme); any other `Authorization` value and the
/// partition trigger header are forwarded verbatim under their own names.
fn extract_context(headers: &HeaderMap, trigger_header: &str) -> RequestContext {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return RequestContext::with_credential(AuthMode::Bearer, "Authorization", token.trim());
        }
        return RequestContext::with_credential(AuthMode::Header, "Authorization", value);
    }

    if let Some(value) = headers.get(trigger_header).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return RequestContext::with_credential(AuthMode::Header, trigger_header, value);
        }
    }

    RequestContext::anonymous()
}

/// Map a resolution failure onto the wire, preserving upstream status codes.
fn resolve_error_response(refraction: &str, path: &str, err: ResolveError) -> Response {
    let status = match &err {
        ResolveError::PolicyBlocked => StatusCode::FORBIDDEN,
        ResolveError::NotFound => StatusCode::NOT_FOUND,
        ResolveError::UpstreamStatus(code) => {
            StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ResolveError::Canceled | ResolveError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ResolveError::Unreachable(_) => StatusCode::BAD_GATEWAY,
        ResolveError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(refraction = %refraction, path = %path, error = %err, "resolution failed");
    } else {
        debug!(refraction = %refraction, path = %path, error = %err, "resolution rejected");
    }

    (status, err.to_string()).into_response()
}

/// Holds the in-flight gauge up for exactly the handler's lifetime.
struct ActiveRequest(Arc<Metrics>);

impl ActiveRequest {
    fn begin(metrics: &Arc<Metrics>) -> Self {
        metrics.active_requests.inc();
        Self(Arc::clone(metrics))
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.0.active_requests.dec();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
