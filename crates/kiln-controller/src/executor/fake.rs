// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted executor for orchestrator tests.

use crate::executor::{Executor, ExecutorError, TaskContext};
use async_trait::async_trait;
use kiln_core::manifest::EffectiveConfig;
use kiln_core::state::{BuildState, TaskResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a fake dispatch does, per task id.
#[derive(Debug, Clone)]
pub(crate) enum FakeOutcome {
    /// Clean remote exit; the "worker" posts a successful result.
    Success { digest: String },
    /// Clean remote exit; the "worker" reports a failed build.
    BuildFailed { error: String },
    /// Clean remote exit; no result callback ever arrives.
    Silent,
    /// Clean remote exit; the result callback lands twice.
    DuplicateSuccess { digest: String },
    /// Executor-level dispatch failure.
    DispatchError(String),
    /// Blocks until the supervisor deadline cancels it.
    HangsUntilCancelled,
    /// Panics inside the supervisor.
    Panics,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeCall {
    pub task_id: String,
    pub arch: String,
    pub ingest_url: String,
}

/// Executor double that simulates remote workers by writing directly to
/// the build state, the way real callbacks would.
pub(crate) struct FakeExecutor {
    default: FakeOutcome,
    by_task: Mutex<HashMap<String, FakeOutcome>>,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeExecutor {
    pub(crate) fn new(default: FakeOutcome) -> Self {
        Self { default, by_task: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    pub(crate) fn script(self, task_id: &str, outcome: FakeOutcome) -> Self {
        self.by_task.lock().insert(task_id.to_string(), outcome);
        self
    }

    pub(crate) fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    fn outcome_for(&self, task_id: &str) -> FakeOutcome {
        self.by_task.lock().get(task_id).cloned().unwrap_or_else(|| self.default.clone())
    }

    fn post_result(state: &BuildState, task_id: &str, arch: &str, digest: &str, success: bool, error: &str) {
        state.set_result(
            task_id,
            TaskResult {
                arch: arch.to_string(),
                image_digest: digest.to_string(),
                success,
                error: error.to_string(),
            },
        );
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn run_task(
        &self,
        state: Arc<BuildState>,
        task_id: &str,
        config: &EffectiveConfig,
        task: &TaskContext,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        self.calls.lock().push(FakeCall {
            task_id: task_id.to_string(),
            arch: config.arch.clone(),
            ingest_url: task.ingest_url.clone(),
        });

        // Let supervisors interleave the way real dispatches do.
        tokio::time::sleep(Duration::from_millis(1)).await;

        match self.outcome_for(task_id) {
            FakeOutcome::Success { digest } => {
                Self::post_result(&state, task_id, &config.arch, &digest, true, "");
                Ok(())
            }
            FakeOutcome::BuildFailed { error } => {
                Self::post_result(&state, task_id, &config.arch, "", false, &error);
                Ok(())
            }
            FakeOutcome::Silent => Ok(()),
            FakeOutcome::DuplicateSuccess { digest } => {
                Self::post_result(&state, task_id, &config.arch, &digest, true, "");
                Self::post_result(&state, task_id, &config.arch, &digest, true, "");
                Ok(())
            }
            FakeOutcome::DispatchError(message) => Err(ExecutorError::Dispatch(message)),
            FakeOutcome::HangsUntilCancelled => {
                cancel.cancelled().await;
                Err(ExecutorError::Timeout(format!(
                    "deadline reached waiting for task {task_id}"
                )))
            }
            FakeOutcome::Panics => panic!("scripted panic in task {task_id}"),
        }
    }
}
