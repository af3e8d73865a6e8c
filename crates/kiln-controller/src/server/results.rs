// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker result callbacks.

use super::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::state::{Level, SetResultOutcome, TaskResult};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(super) struct ResultPayload {
    task_id: String,
    arch: String,
    image_digest: String,
    success: bool,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ResultQuery {
    task: Option<String>,
}

fn short_digest(digest: &str) -> &str {
    if digest.len() > 12 {
        &digest[..12]
    } else {
        digest
    }
}

/// `POST /build/:id/result?task=` — JSON result callback. The query task
/// id wins over the body's. Duplicates are idempotent: a retry with the
/// same digest is dropped, a conflicting digest is rejected and the first
/// value stands; both answer 200.
pub(super) async fn submit(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Query(query): Query<ResultQuery>,
    body: Bytes,
) -> Response {
    let Ok(payload) = serde_json::from_slice::<ResultPayload>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid json").into_response();
    };

    let task_id = query
        .task
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| payload.task_id.trim())
        .to_string();
    if task_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing task parameter").into_response();
    }

    let Some(build) = state.store.get(&build_id) else {
        return (StatusCode::NOT_FOUND, "unknown build id").into_response();
    };
    if build.id() != build_id {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("state id mismatch: expected {build_id}, got {}", build.id()),
        )
            .into_response();
    }

    build.append_log(
        Level::Debug,
        format!(
            "[result] received: build={build_id} task={task_id} arch={} success={}",
            payload.arch, payload.success
        ),
    );

    let outcome = build.set_result(
        &task_id,
        TaskResult {
            arch: payload.arch.clone(),
            image_digest: payload.image_digest.clone(),
            success: payload.success,
            error: payload.error,
        },
    );

    match outcome {
        SetResultOutcome::Recorded => {
            build.append_log(
                Level::Info,
                format!(
                    "[result] saved: task={task_id} arch={} digest={} ({}/{})",
                    payload.arch,
                    short_digest(&payload.image_digest),
                    build.results_received(),
                    build.total_tasks()
                ),
            );
        }
        SetResultOutcome::DuplicateIgnored => {
            build.append_log(
                Level::Debug,
                format!("[result] duplicate result for task {task_id} with same digest, ignoring"),
            );
        }
        SetResultOutcome::DigestConflict { existing_digest } => {
            build.append_log(
                Level::Error,
                format!(
                    "[result] duplicate result for task {task_id} with different digest (existing={}, new={}), rejecting new",
                    short_digest(&existing_digest),
                    short_digest(&payload.image_digest)
                ),
            );
        }
    }

    StatusCode::OK.into_response()
}
