// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::executor::fake::{FakeExecutor, FakeOutcome};
use crate::publish::ManifestPublisher;
use async_trait::async_trait;
use kiln_core::state::LogEntry;
use parking_lot::Mutex;

struct PublishCall {
    destination: String,
    images: Vec<PlatformImage>,
}

#[derive(Default)]
struct FakePublisher {
    fail_with: Option<String>,
    calls: Mutex<Vec<PublishCall>>,
}

impl FakePublisher {
    fn calls(&self) -> Vec<(String, Vec<PlatformImage>)> {
        self.calls.lock().iter().map(|c| (c.destination.clone(), c.images.clone())).collect()
    }
}

#[async_trait]
impl ManifestPublisher for FakePublisher {
    async fn publish(
        &self,
        _state: &BuildState,
        images: &[PlatformImage],
        destination: &str,
        _credentials: &[kiln_core::manifest::RegistryCredential],
    ) -> Result<(), PublishError> {
        self.calls.lock().push(PublishCall {
            destination: destination.to_string(),
            images: images.to_vec(),
        });
        match &self.fail_with {
            Some(message) => Err(PublishError::Push(message.clone())),
            None => Ok(()),
        }
    }
}

struct Harness {
    store: Arc<StateStore>,
    fargate: Arc<FakeExecutor>,
    kubernetes: Option<Arc<FakeExecutor>>,
    publisher: Arc<FakePublisher>,
    orchestrator: Orchestrator,
}

fn harness_with(
    fargate: FakeExecutor,
    kubernetes: Option<FakeExecutor>,
    publisher: FakePublisher,
    config: OrchestratorConfig,
) -> Harness {
    let store = Arc::new(StateStore::new());
    let fargate = Arc::new(fargate);
    let kubernetes = kubernetes.map(Arc::new);
    let publisher = Arc::new(publisher);
    let orchestrator = Orchestrator::new(
        store.clone(),
        fargate.clone(),
        kubernetes.clone().map(|k| k as Arc<dyn Executor>),
        publisher.clone(),
        Defaults::default(),
        config,
    );
    Harness { store, fargate, kubernetes, publisher, orchestrator }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        controller_url: "http://controller".to_string(),
        task_timeout: Duration::from_secs(5),
        result_timeout: Duration::from_millis(300),
    }
}

fn harness(fargate: FakeExecutor) -> Harness {
    harness_with(fargate, None, FakePublisher::default(), fast_config())
}

async fn run_to_completion(
    harness: &Harness,
    manifest: &str,
) -> (String, Arc<BuildState>, Vec<LogEntry>) {
    let (build_id, state) = harness
        .orchestrator
        .start_build(manifest.as_bytes(), "builds", "ctx/src.tar.gz", None)
        .await
        .expect("build accepted");

    tokio::time::timeout(Duration::from_secs(10), state.done().cancelled())
        .await
        .expect("build finished in time");

    let mut logs = Vec::new();
    if let Some(mut rx) = state.take_log_stream() {
        while let Some(entry) = rx.recv().await {
            logs.push(entry);
        }
    }
    (build_id, state, logs)
}

fn final_verdict(logs: &[LogEntry]) -> &str {
    logs.last().map(|e| e.message.as_str()).unwrap_or_default()
}

#[tokio::test]
async fn single_arch_build_succeeds_without_assembly() {
    let h = harness(FakeExecutor::new(FakeOutcome::Success {
        digest: "sha256:abc".to_string(),
    }));

    let manifest = r#"
global:
  arch: amd64
  platform: ecs
  kaniko:
    destination: "r/a:v1"
bake:
  - {}
"#;
    let (build_id, state, logs) = run_to_completion(&h, manifest).await;

    assert!(build_id.starts_with("b-"));
    assert!(state.is_single_arch());
    assert!(!state.has_error());
    assert_eq!(state.results_received(), 1);
    assert_eq!(final_verdict(&logs), "BUILD SUCCEEDED");
    assert!(h.publisher.calls().is_empty());

    let calls = h.fargate.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].task_id, "amd64");
    assert_eq!(calls[0].ingest_url, format!("http://controller/build/{build_id}/logs/ingest"));
}

#[tokio::test]
async fn multi_arch_build_assembles_manifest_list() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Silent)
            .script("amd64", FakeOutcome::Success { digest: "sha256:aaa".to_string() })
            .script("arm64", FakeOutcome::Success { digest: "sha256:bbb".to_string() }),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: arm64
"#;
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    assert!(!state.has_error(), "unexpected error: {:?}", state.error());
    assert_eq!(final_verdict(&logs), "BUILD SUCCEEDED");

    let task_ids: Vec<String> = h.fargate.calls().iter().map(|c| c.task_id.clone()).collect();
    assert_eq!(task_ids, vec!["amd64", "arm64"]);

    let publishes = h.publisher.calls();
    assert_eq!(publishes.len(), 1);
    let (destination, images) = &publishes[0];
    assert_eq!(destination, "r/a:v1");

    let pushed: Vec<(&str, &str)> =
        images.iter().map(|i| (i.image.as_str(), i.digest.as_str())).collect();
    assert_eq!(
        pushed,
        vec![("r/a:v1_amd64", "sha256:aaa"), ("r/a:v1_arm64", "sha256:bbb")]
    );
}

#[tokio::test]
async fn duplicate_arch_tasks_get_index_suffixes() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Silent)
            .script("amd64-0", FakeOutcome::Success { digest: "sha256:aaa".to_string() })
            .script("amd64-1", FakeOutcome::Success { digest: "sha256:bbb".to_string() }),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: amd64
"#;
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    assert!(state.has_duplicate_arch());
    assert_eq!(final_verdict(&logs), "BUILD SUCCEEDED");

    let mut task_ids: Vec<String> = h.fargate.calls().iter().map(|c| c.task_id.clone()).collect();
    task_ids.sort();
    assert_eq!(task_ids, vec!["amd64-0", "amd64-1"]);

    let publishes = h.publisher.calls();
    let images: Vec<&str> = publishes[0].1.iter().map(|i| i.image.as_str()).collect();
    assert_eq!(images, vec!["r/a:v1_amd64-0", "r/a:v1_amd64-1"]);
}

#[tokio::test]
async fn missing_result_times_out_and_fails_the_build() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:ok".to_string() })
            .script("arm", FakeOutcome::Silent),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: arm64
  - arch: arm
"#;
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    assert_eq!(
        state.error().as_deref(),
        Some("timeout waiting for agent results (2/3 received)")
    );
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
    assert!(h.publisher.calls().is_empty());
}

#[tokio::test]
async fn duplicate_result_callback_is_idempotent() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:bbb".to_string() })
            .script("amd64", FakeOutcome::DuplicateSuccess { digest: "sha256:A".to_string() }),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: arm64
"#;
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    assert_eq!(state.results_received(), 2);
    assert!(!state.has_error());
    assert_eq!(final_verdict(&logs), "BUILD SUCCEEDED");
}

#[tokio::test]
async fn worker_reported_failure_fails_the_build_but_siblings_run() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:ok".to_string() })
            .script("amd64", FakeOutcome::BuildFailed { error: "exit=1".to_string() }),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: arm64
"#;
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    assert_eq!(state.error().as_deref(), Some("task amd64 failed: exit=1"));
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
    assert!(h.publisher.calls().is_empty());
    // The sibling still ran to completion and posted its result.
    assert_eq!(h.fargate.calls().len(), 2);
    assert_eq!(state.results_received(), 2);
}

#[tokio::test]
async fn dispatch_error_is_sticky_and_siblings_continue() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:ok".to_string() })
            .script("arm64", FakeOutcome::DispatchError("run task refused".to_string())),
    );

    let manifest = "bake: [{arch: amd64}, {arch: arm64}]";
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    let error = state.error().unwrap_or_default();
    assert!(error.contains("run task refused"), "unexpected error: {error}");
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
    assert_eq!(h.fargate.calls().len(), 2);
}

#[tokio::test]
async fn panicking_supervisor_becomes_a_sticky_error() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:ok".to_string() })
            .script("amd64", FakeOutcome::Panics),
    );

    let manifest = "bake: [{arch: amd64}, {arch: arm64}]";
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    let error = state.error().unwrap_or_default();
    assert!(error.contains("panic in task amd64"), "unexpected error: {error}");
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
}

#[tokio::test]
async fn supervisor_deadline_cancels_a_hung_dispatch() {
    let h = harness_with(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:ok".to_string() })
            .script("amd64", FakeOutcome::HangsUntilCancelled),
        None,
        FakePublisher::default(),
        OrchestratorConfig {
            controller_url: "http://controller".to_string(),
            task_timeout: Duration::from_millis(100),
            result_timeout: Duration::from_millis(200),
        },
    );

    let manifest = "bake: [{arch: amd64}, {arch: arm64}]";
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    let error = state.error().unwrap_or_default();
    assert!(error.contains("deadline"), "unexpected error: {error}");
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
}

#[tokio::test]
async fn k8s_tasks_route_to_the_kubernetes_executor() {
    let h = harness_with(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:ecs".to_string() }),
        Some(FakeExecutor::new(FakeOutcome::Success { digest: "sha256:k8s".to_string() })),
        FakePublisher::default(),
        fast_config(),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - {arch: amd64, platform: ecs}
  - {arch: arm64, platform: k8s}
"#;
    let (_, state, _) = run_to_completion(&h, manifest).await;

    assert!(!state.has_error());
    assert_eq!(h.fargate.calls().len(), 1);
    assert_eq!(h.fargate.calls()[0].task_id, "amd64");
    let kubernetes = h.kubernetes.as_ref().unwrap();
    assert_eq!(kubernetes.calls().len(), 1);
    assert_eq!(kubernetes.calls()[0].task_id, "arm64");
}

#[tokio::test]
async fn k8s_dispatch_without_executor_fails_fast() {
    let h = harness(FakeExecutor::new(FakeOutcome::Success {
        digest: "sha256:ok".to_string(),
    }));

    let manifest = "bake: [{arch: amd64, platform: k8s}]";
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    let error = state.error().unwrap_or_default();
    assert!(error.contains("kubernetes executor not configured"), "unexpected error: {error}");
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
    assert!(h.fargate.calls().is_empty());
}

#[tokio::test]
async fn explicit_per_target_destination_survives_assembly() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Silent)
            .script("amd64", FakeOutcome::Success { digest: "sha256:aaa".to_string() })
            .script("arm64", FakeOutcome::Success { digest: "sha256:bbb".to_string() }),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
    kaniko: {destination: "r/custom:tag"}
  - arch: arm64
"#;
    let (_, _, logs) = run_to_completion(&h, manifest).await;
    assert_eq!(final_verdict(&logs), "BUILD SUCCEEDED");

    let publishes = h.publisher.calls();
    let images: Vec<&str> = publishes[0].1.iter().map(|i| i.image.as_str()).collect();
    assert_eq!(images, vec!["r/custom:tag", "r/a:v1_arm64"]);
}

#[tokio::test]
async fn no_push_tasks_are_excluded_from_assembly() {
    let h = harness(
        FakeExecutor::new(FakeOutcome::Silent)
            .script("amd64", FakeOutcome::Success { digest: "sha256:aaa".to_string() })
            .script("arm64", FakeOutcome::Success { digest: "sha256:bbb".to_string() })
            .script("arm", FakeOutcome::Success { digest: "sha256:ccc".to_string() }),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: arm64
  - arch: arm
    kaniko: {no-push: true}
"#;
    let (_, state, _) = run_to_completion(&h, manifest).await;

    assert!(!state.has_error(), "unexpected error: {:?}", state.error());
    let publishes = h.publisher.calls();
    let images: Vec<&str> = publishes[0].1.iter().map(|i| i.image.as_str()).collect();
    assert_eq!(images, vec!["r/a:v1_amd64", "r/a:v1_arm64"]);
}

#[tokio::test]
async fn publish_failure_is_sticky() {
    let h = harness_with(
        FakeExecutor::new(FakeOutcome::Success { digest: "sha256:aaa".to_string() }),
        None,
        FakePublisher { fail_with: Some("registry said no".to_string()), ..Default::default() },
        fast_config(),
    );

    let manifest = r#"
global:
  kaniko:
    destination: "r/a:v1"
bake:
  - arch: amd64
  - arch: arm64
"#;
    let (_, state, logs) = run_to_completion(&h, manifest).await;

    let error = state.error().unwrap_or_default();
    assert!(error.contains("registry said no"), "unexpected error: {error}");
    assert_eq!(final_verdict(&logs), "BUILD FAILED");
}

#[tokio::test]
async fn invalid_manifest_is_rejected_synchronously() {
    let h = harness(FakeExecutor::new(FakeOutcome::Silent));

    let result = h
        .orchestrator
        .start_build(b"global: [broken", "builds", "ctx/src.tar.gz", None)
        .await;
    assert!(matches!(result, Err(ManifestError::Yaml(_))));

    let result = h.orchestrator.start_build(b"bake: [{}]", "builds", "ctx/src.tar.gz", None).await;
    assert!(matches!(result, Err(ManifestError::MissingArch { .. })));

    // No state escaped registration for either failure.
    assert!(h.store.ids().is_empty());
}

#[tokio::test]
async fn build_ids_carry_the_service_name() {
    let h = harness(FakeExecutor::new(FakeOutcome::Success {
        digest: "sha256:abc".to_string(),
    }));

    let (build_id, state) = h
        .orchestrator
        .start_build(b"bake: [{arch: amd64}]", "builds", "ctx/src.tar.gz", Some("checkout"))
        .await
        .unwrap();

    assert!(build_id.starts_with("b-"));
    assert!(build_id.ends_with("-checkout"));
    assert!(h.store.get(&build_id).is_some());
    state.done().cancelled().await;
}

#[tokio::test]
async fn registered_state_is_reachable_while_running() {
    let h = harness(FakeExecutor::new(FakeOutcome::Success {
        digest: "sha256:abc".to_string(),
    }));

    let (build_id, state) =
        h.orchestrator.start_build(b"bake: [{arch: amd64}]", "builds", "ctx", None).await.unwrap();

    let found = h.store.get(&build_id).expect("registered");
    assert_eq!(found.id(), build_id);
    state.done().cancelled().await;
}
