// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build submission.

use super::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct SubmitQuery {
    context_key: Option<String>,
    service_name: Option<String>,
}

/// `POST /build` — body is the bake manifest. Validation failures surface
/// here; everything after acceptance surfaces through the log stream.
pub(super) async fn submit(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }

    let Some(context_key) = query.context_key.filter(|key| !key.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing context_key").into_response();
    };

    let Some(bucket) = state.context_bucket.clone() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "context bucket not configured")
            .into_response();
    };

    match state
        .orchestrator
        .start_build(&body, &bucket, &context_key, query.service_name.as_deref())
        .await
    {
        Ok((build_id, _)) => {
            Json(json!({ "buildID": build_id, "status": "started" })).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
