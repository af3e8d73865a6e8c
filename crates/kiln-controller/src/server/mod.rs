// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP surface: submit, log stream, log ingest, result callback.
//!
//! Build routes sit behind an optional shared-token check; health and
//! readiness stay open for probes.

mod builds;
mod logs;
mod results;

use crate::orchestrator::Orchestrator;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use kiln_core::store::StateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<StateStore>,
    /// Object-storage bucket for uploaded build contexts (`S3_BUCKET`).
    pub context_bucket: Option<String>,
    /// When set, build routes require `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    pub ready: Arc<AtomicBool>,
}

/// Builds the controller router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/build", post(builds::submit))
        .route("/build/:id/logs", get(logs::stream))
        .route("/build/:id/logs/ingest", post(logs::ingest))
        .route("/build/:id/result", post(results::submit))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .route("/", get(root))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(token) = &state.auth_token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(token.as_str()) {
            return (StatusCode::UNAUTHORIZED, "invalid auth token").into_response();
        }
    }
    next.run(request).await
}

async fn root(State(state): State<AppState>) -> Response {
    if !state.ready.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "build controller is starting...")
            .into_response();
    }
    "build controller is running".into_response()
}

async fn live() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Response {
    if !state.ready.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response();
    }
    "ready".into_response()
}

#[cfg(test)]
#[path = "routes_tests.rs"]
mod tests;
