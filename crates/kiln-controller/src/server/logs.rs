// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log streaming and log ingest.

use super::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures::StreamExt;
use kiln_core::state::{BuildState, Level, LogEntry};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

fn encode(entry: &LogEntry) -> Bytes {
    let mut line = serde_json::to_vec(entry).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

struct StreamState {
    rx: mpsc::Receiver<LogEntry>,
    state: Arc<BuildState>,
    trailer_sent: bool,
}

/// `GET /build/:id/logs` — chunked JSON-lines of the build's log entries.
/// On channel close the stream ends with a final verdict entry.
pub(super) async fn stream(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
) -> Response {
    let Some(build) = state.store.get(&build_id) else {
        return (StatusCode::NOT_FOUND, "unknown build id").into_response();
    };

    let Some(rx) = build.take_log_stream() else {
        return (StatusCode::CONFLICT, "log stream already claimed").into_response();
    };

    let stream = futures::stream::unfold(
        StreamState { rx, state: build, trailer_sent: false },
        |mut s| async move {
            if s.trailer_sent {
                return None;
            }
            match s.rx.recv().await {
                Some(entry) => Some((encode(&entry), s)),
                None => {
                    s.trailer_sent = true;
                    let trailer = if s.state.has_error() {
                        LogEntry::now(Level::Error, "BUILD FAILED")
                    } else {
                        LogEntry::now(Level::Info, "BUILD SUCCEEDED")
                    };
                    Some((encode(&trailer), s))
                }
            }
        },
    )
    .map(Ok::<Bytes, Infallible>);

    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct IngestQuery {
    task: Option<String>,
}

/// `POST /build/:id/logs/ingest?task=` — streaming plain-text worker
/// output. Each newline-terminated line lands as an info-level entry;
/// end-of-body marks the task's ingest done.
pub(super) async fn ingest(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Query(query): Query<IngestQuery>,
    body: Body,
) -> Response {
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

    let task_id = query
        .task
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("unknown")
        .to_string();

    build.append_log(Level::Debug, format!("ingest from task={task_id}"));

    let mut body_stream = body.into_data_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = body_stream.next().await {
        let Ok(chunk) = chunk else { break };
        buffer.extend_from_slice(&chunk);
        drain_lines(&build, &task_id, &mut buffer);
    }

    // A trailing line without a final newline still counts.
    if !buffer.is_empty() {
        append_line(&build, &task_id, &buffer);
    }

    build.append_log(Level::Debug, format!("ingest closed for task={task_id} (EOF)"));
    build.mark_ingest_done(&task_id);

    StatusCode::OK.into_response()
}

fn drain_lines(build: &BuildState, task_id: &str, buffer: &mut BytesMut) {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line = buffer.split_to(pos + 1);
        append_line(build, task_id, &line);
    }
}

fn append_line(build: &BuildState, task_id: &str, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let message = line.trim_end_matches(['\r', '\n']);
    if !message.is_empty() {
        build.mark_ingest_started(task_id);
    }
    build.append_log(Level::Info, message.to_string());
}
