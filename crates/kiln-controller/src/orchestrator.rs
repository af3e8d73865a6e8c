// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build orchestration: plan → fan-out → supervise → assemble → finalize.
//!
//! `start_build` resolves the manifest synchronously, registers the build
//! state, and spawns one supervisor per effective config plus a single
//! finalizer. Supervisors run independently: one failing, timing out, or
//! panicking never cancels its siblings — errors accumulate first-wins on
//! the build state, partial results are still collected, and the
//! finalizer always runs and closes the log stream exactly once.

use crate::env;
use crate::executor::{Executor, ExecutorError, TaskContext};
use crate::publish::{ManifestPublisher, PlatformImage, PublishError};
use crate::executor::worker_env;
use kiln_core::manifest::{self, Defaults, EffectiveConfig, ManifestError, Platform};
use kiln_core::state::{BuildShape, BuildState, Level};
use kiln_core::store::StateStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tunables captured at startup; injectable in tests.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Public base URL for worker callbacks.
    pub controller_url: String,
    /// Per-supervisor deadline.
    pub task_timeout: Duration,
    /// Finalizer's bounded wait for outstanding results.
    pub result_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            controller_url: env::controller_url(),
            task_timeout: env::build_task_timeout(),
            result_timeout: env::build_result_timeout(),
        }
    }
}

/// Distributes build tasks across executors and collects results.
pub struct Orchestrator {
    store: Arc<StateStore>,
    fargate: Arc<dyn Executor>,
    kubernetes: Option<Arc<dyn Executor>>,
    publisher: Arc<dyn ManifestPublisher>,
    defaults: Defaults,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        fargate: Arc<dyn Executor>,
        kubernetes: Option<Arc<dyn Executor>>,
        publisher: Arc<dyn ManifestPublisher>,
        defaults: Defaults,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, fargate, kubernetes, publisher, defaults, config }
    }

    /// Accepts a build request, fans out its tasks, and returns the build
    /// id and state. The caller may immediately consume the state's log
    /// stream; everything after validation surfaces through it.
    pub async fn start_build(
        &self,
        manifest_bytes: &[u8],
        context_bucket: &str,
        context_key: &str,
        service_name: Option<&str>,
    ) -> Result<(String, Arc<BuildState>), ManifestError> {
        let document = manifest::parse(manifest_bytes)?;
        let effective = manifest::resolve(&document, &self.defaults)?;

        let push_tasks: Vec<&EffectiveConfig> =
            effective.iter().filter(|ef| ef.is_pushing()).collect();

        let mut arch_count: HashMap<&str, usize> = HashMap::new();
        for ef in &push_tasks {
            *arch_count.entry(ef.arch.as_str()).or_default() += 1;
        }
        let has_duplicate_arch = arch_count.values().any(|&count| count > 1);
        let is_single_arch = push_tasks.len() <= 1;
        let global_destination =
            document.global.kaniko.destination.clone().unwrap_or_default();

        let build_id = generate_build_id(service_name);
        let state = Arc::new(BuildState::new(
            &build_id,
            effective.len(),
            BuildShape { is_single_arch, global_destination, has_duplicate_arch },
        ));
        self.store.register(&build_id, state.clone());

        state.append_log(Level::Info, "build accepted by orchestrator");
        state.append_log(Level::Info, format!("{} build tasks found", effective.len()));

        let task = TaskContext {
            context_bucket: context_bucket.to_string(),
            context_key: context_key.to_string(),
            ingest_url: format!("{}/build/{}/logs/ingest", self.config.controller_url, build_id),
        };

        let mut supervisors = JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, String> = HashMap::new();

        for (index, ef) in effective.iter().enumerate() {
            let task_id = synthetic_task_id(&ef.arch, index, has_duplicate_arch);
            let handle = supervisors.spawn(supervise(
                self.fargate.clone(),
                self.kubernetes.clone(),
                state.clone(),
                task_id.clone(),
                ef.clone(),
                task.clone(),
                self.config.task_timeout,
            ));
            task_names.insert(handle.id(), task_id);
        }

        tokio::spawn(finalize(
            supervisors,
            task_names,
            state.clone(),
            effective,
            self.publisher.clone(),
            self.config.result_timeout,
        ));

        Ok((build_id, state))
    }
}

fn synthetic_task_id(arch: &str, index: usize, has_duplicate_arch: bool) -> String {
    if has_duplicate_arch {
        format!("{arch}-{index}")
    } else {
        arch.to_string()
    }
}

/// Runs one task under its own deadline, recording failures first-wins.
async fn supervise(
    fargate: Arc<dyn Executor>,
    kubernetes: Option<Arc<dyn Executor>>,
    state: Arc<BuildState>,
    task_id: String,
    config: EffectiveConfig,
    task: TaskContext,
    timeout: Duration,
) {
    state.append_log(
        Level::Info,
        format!("[task {task_id}] starting ({} / {})", config.platform, config.arch),
    );

    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let executor = match config.platform {
        Platform::Ecs => Some(fargate),
        Platform::K8s => kubernetes,
    };

    let result = match executor {
        Some(executor) => {
            executor.run_task(state.clone(), &task_id, &config, &task, cancel.clone()).await
        }
        None => Err(ExecutorError::Dispatch("kubernetes executor not configured".to_string())),
    };
    deadline.abort();

    match result {
        Ok(()) => state.append_log(Level::Info, format!("[task {task_id}] executor finished")),
        Err(err) => {
            state.append_log(Level::Error, format!("[task {task_id}] failed: {err}"));
            state.set_error(err.to_string());
        }
    }
}

/// Waits for every supervisor, then for the result set, assembles the
/// manifest list when the build qualifies, and finishes the state.
async fn finalize(
    mut supervisors: JoinSet<()>,
    task_names: HashMap<tokio::task::Id, String>,
    state: Arc<BuildState>,
    effective: Vec<EffectiveConfig>,
    publisher: Arc<dyn ManifestPublisher>,
    result_timeout: Duration,
) {
    while let Some(joined) = supervisors.join_next_with_id().await {
        if let Err(err) = joined {
            if err.is_panic() {
                let task_id = task_names
                    .get(&err.id())
                    .map(String::as_str)
                    .unwrap_or("unknown");
                let message = format!("panic in task {task_id}: {err}");
                state.append_log(Level::Error, message.clone());
                state.set_error(message);
            }
        }
    }

    state.append_log(
        Level::Debug,
        format!(
            "all executors finished; results {}/{}",
            state.results_received(),
            state.total_tasks()
        ),
    );

    if !state.wait_results(result_timeout).await {
        let message = format!(
            "timeout waiting for agent results ({}/{} received)",
            state.results_received(),
            state.total_tasks()
        );
        state.append_log(Level::Error, message.clone());
        state.set_error(message);
    }

    if !state.is_single_arch() && !state.has_error() {
        state.append_log(Level::Info, "starting multi-arch manifest creation");
        match assemble(publisher.as_ref(), &state, &effective).await {
            Ok(()) => state.append_log(
                Level::Info,
                format!("multi-arch manifest created: {}", state.global_destination()),
            ),
            Err(err) => {
                state.append_log(Level::Error, format!("manifest creation failed: {err}"));
                state.set_error(err.to_string());
            }
        }
    }

    state.finish(state.error());
}

/// Resolves each pushing task's result and pushed image, then hands the
/// set to the publisher. Task ids are recomputed exactly as at dispatch.
async fn assemble(
    publisher: &dyn ManifestPublisher,
    state: &BuildState,
    effective: &[EffectiveConfig],
) -> Result<(), PublishError> {
    let results = state.results();
    let mut images = Vec::new();
    let mut credentials = None;

    for (index, ef) in effective.iter().enumerate() {
        if !ef.is_pushing() {
            continue;
        }

        let task_id = synthetic_task_id(&ef.arch, index, state.has_duplicate_arch());
        let Some(result) = results.get(&task_id) else {
            let mut keys: Vec<String> = results.keys().cloned().collect();
            keys.sort();
            return Err(PublishError::MissingResult {
                task_id,
                keys,
                expected: state.total_tasks(),
                received: state.results_received(),
            });
        };

        if !result.success {
            return Err(PublishError::TaskFailed {
                task_id,
                error: result.error.clone(),
            });
        }

        let pushed = worker_env::push_destination(state, ef, &task_id);
        state.append_log(
            Level::Debug,
            format!("adding to manifest: task={task_id} image={pushed} digest={}", result.image_digest),
        );

        images.push(PlatformImage {
            arch: ef.arch.clone(),
            image: pushed,
            digest: result.image_digest.clone(),
        });
        credentials.get_or_insert_with(|| ef.credentials.clone());
    }

    state.append_log(
        Level::Info,
        format!("creating multi-arch manifest with {} images", images.len()),
    );

    publisher
        .publish(state, &images, state.global_destination(), &credentials.unwrap_or_default())
        .await
}

/// `b-<unix-nano>-<4-hex>-<service>` with a service name, else
/// `b-<unix-nano>-<8-hex-uuid>`.
fn generate_build_id(service_name: Option<&str>) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let uuid = Uuid::new_v4().simple().to_string();

    match service_name.filter(|name| !name.is_empty()) {
        Some(name) => format!("b-{nanos}-{}-{name}", &uuid[..4]),
        None => format!("b-{nanos}-{}", &uuid[..8]),
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
