// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::executor::fake::{FakeExecutor, FakeOutcome};
use crate::orchestrator::OrchestratorConfig;
use crate::publish::{ManifestPublisher, PlatformImage, PublishError};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::Request;
use kiln_core::manifest::{Defaults, RegistryCredential};
use kiln_core::state::{BuildShape, BuildState, Level, LogEntry, TaskResult};
use std::time::Duration;
use tower::ServiceExt;

struct NoopPublisher;

#[async_trait]
impl ManifestPublisher for NoopPublisher {
    async fn publish(
        &self,
        _state: &BuildState,
        _images: &[PlatformImage],
        _destination: &str,
        _credentials: &[RegistryCredential],
    ) -> Result<(), PublishError> {
        Ok(())
    }
}

struct TestApp {
    router: Router,
    store: Arc<StateStore>,
}

fn test_app_with(auth_token: Option<String>, context_bucket: Option<String>) -> TestApp {
    let store = Arc::new(StateStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(FakeExecutor::new(FakeOutcome::Success { digest: "sha256:abc".to_string() })),
        None,
        Arc::new(NoopPublisher),
        Defaults::default(),
        OrchestratorConfig {
            controller_url: "http://controller".to_string(),
            task_timeout: Duration::from_secs(5),
            result_timeout: Duration::from_millis(200),
        },
    ));
    let ready = Arc::new(AtomicBool::new(true));
    let state =
        AppState { orchestrator, store: store.clone(), context_bucket, auth_token, ready };
    TestApp { router: router(state), store }
}

fn test_app() -> TestApp {
    test_app_with(None, Some("builds".to_string()))
}

fn seeded_state(store: &StateStore, id: &str, total_tasks: usize) -> Arc<BuildState> {
    let state = Arc::new(BuildState::new(id, total_tasks, BuildShape::default()));
    store.register(id, state.clone());
    state
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn submit_starts_a_build() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/build?context_key=ctx/src.tar.gz&service_name=checkout")
        .body(Body::from("bake: [{arch: amd64}]"))
        .unwrap();

    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "started");
    let build_id = body["buildID"].as_str().unwrap();
    assert!(build_id.starts_with("b-"));
    assert!(app.store.get(build_id).is_some());
}

#[tokio::test]
async fn submit_rejects_empty_body_and_missing_key() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build?context_key=ctx")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build")
                .body(Body::from("bake: [{arch: amd64}]"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submit_without_bucket_is_a_server_error() {
    let app = test_app_with(None, None);
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build?context_key=ctx")
                .body(Body::from("bake: [{arch: amd64}]"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn submit_surfaces_validation_errors() {
    let app = test_app();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build?context_key=ctx")
                .body(Body::from("bake: [{}]"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.contains("arch not specified"));
}

#[tokio::test]
async fn log_stream_replays_entries_and_trails_with_verdict() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-logs", 1);
    state.append_log(Level::Info, "hello");
    state.finish(None);

    let response = app
        .router
        .oneshot(Request::builder().uri("/build/b-logs/logs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "application/json");

    let body = body_string(response).await;
    let lines: Vec<LogEntry> =
        body.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
    assert_eq!(lines.first().unwrap().message, "hello");
    // The channel trailer and the stream's own final entry both say it.
    assert_eq!(lines.last().unwrap().message, "BUILD SUCCEEDED");
}

#[tokio::test]
async fn log_stream_reports_failure_verdict() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-fail", 1);
    state.finish(Some("boom".to_string()));

    let response = app
        .router
        .oneshot(Request::builder().uri("/build/b-fail/logs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_string(response).await;
    let last: LogEntry = serde_json::from_str(body.lines().last().unwrap()).unwrap();
    assert_eq!(last.message, "BUILD FAILED");
    assert_eq!(last.level, Level::Error);
}

#[tokio::test]
async fn log_stream_unknown_build_is_404() {
    let app = test_app();
    let response = app
        .router
        .oneshot(Request::builder().uri("/build/b-ghost/logs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn log_stream_single_consumer() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-taken", 1);
    let _rx = state.take_log_stream();

    let response = app
        .router
        .oneshot(Request::builder().uri("/build/b-taken/logs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn ingest_appends_lines_and_marks_done() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-ingest", 1);
    let mut rx = state.take_log_stream().unwrap();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-ingest/logs/ingest?task=amd64")
                .body(Body::from("step 1/4\nstep 2/4\ntail without newline"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(state.ingest_started("amd64"));
    assert!(state.ingest_done("amd64"));

    let mut messages = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        if entry.level == Level::Info {
            messages.push(entry.message);
        }
    }
    assert_eq!(messages, vec!["step 1/4", "step 2/4", "tail without newline"]);
}

#[tokio::test]
async fn ingest_without_task_defaults_to_unknown() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-anon", 1);

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-anon/logs/ingest")
                .body(Body::from("line\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.ingest_done("unknown"));
}

#[tokio::test]
async fn ingest_unknown_build_is_404() {
    let app = test_app();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-ghost/logs/ingest?task=amd64")
                .body(Body::from("line\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn result_callback_records_and_is_idempotent() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-res", 2);

    let payload = r#"{"taskId":"amd64","arch":"amd64","imageDigest":"sha256:abc","success":true}"#;
    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/build/b-res/result?task=amd64")
                    .header("content-type", "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(state.results_received(), 1);
    assert_eq!(state.results().get("amd64").unwrap().image_digest, "sha256:abc");
}

#[tokio::test]
async fn result_conflicting_digest_keeps_the_first() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-conflict", 1);
    state.set_result(
        "amd64",
        TaskResult {
            arch: "amd64".to_string(),
            image_digest: "sha256:first".to_string(),
            success: true,
            error: String::new(),
        },
    );

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-conflict/result?task=amd64")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"taskId":"amd64","arch":"amd64","imageDigest":"sha256:second","success":true}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.results().get("amd64").unwrap().image_digest, "sha256:first");
}

#[tokio::test]
async fn result_query_task_wins_over_body() {
    let app = test_app();
    let state = seeded_state(&app.store, "b-query", 1);

    app.router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-query/result?task=arm64")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"taskId":"amd64","arch":"arm64","imageDigest":"sha256:abc","success":true}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(state.has_result("arm64"));
    assert!(!state.has_result("amd64"));
}

#[tokio::test]
async fn result_rejects_malformed_and_unrouted_payloads() {
    let app = test_app();
    seeded_state(&app.store, "b-bad", 1);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-bad/result?task=amd64")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // No task in query or body.
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-bad/result")
                .body(Body::from(r#"{"arch":"amd64","success":true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn result_unknown_build_is_404() {
    let app = test_app();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build/b-ghost/result?task=amd64")
                .body(Body::from(r#"{"success":true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_token_guards_build_routes_only() {
    let app = test_app_with(Some("sekrit".to_string()), Some("builds".to_string()));

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/build/b-1/logs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/build/b-1/logs")
                .header("authorization", "Bearer sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // Authenticated but unknown id.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn readiness_reflects_the_flag() {
    let app = test_app();
    let response = app
        .router
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
