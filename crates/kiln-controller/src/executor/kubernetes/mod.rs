// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Kubernetes executor — runs each build task as a one-shot batch Job.
//!
//! # Supervision
//!
//! After creating the Job the executor watches it for a terminal
//! condition (`Complete` or `Failed`), with a 5-second poll ticking
//! alongside for observability. A watch stream that ends without a
//! verdict falls back to a one-shot `Get`. The watch phase runs under its
//! own 30-minute deadline, independent of the supervisor's; once it ends
//! — for any reason, including cancellation — the pod exit code is
//! inspected under a fresh context so a late worker still gets its state
//! read, its result callback awaited, and its ingest stream drained.

mod job;

use crate::executor::{worker_env, Executor, ExecutorError, TaskContext};
use crate::k8s_config::K8sServerConfig;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kiln_core::manifest::EffectiveConfig;
use kiln_core::resources::{format_k8s_cpu, format_k8s_memory, parse_cpu_units, parse_memory_mb};
use kiln_core::state::{BuildState, Level};
use kube::api::{Api, ListParams, PostParams, WatchParams};
use kube::core::WatchEvent;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deadline for the watch phase, independent of the supervisor deadline.
const WATCH_DEADLINE: Duration = Duration::from_secs(30 * 60);
/// Observability tick while watching.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Soft wait for the worker's result callback after pod exit.
const RESULT_DRAIN_WAIT: Duration = Duration::from_secs(30);
/// Soft wait for the worker's ingest stream to finalize after pod exit.
const INGEST_DRAIN_WAIT: Duration = Duration::from_secs(90);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the watch phase ended.
enum JobOutcome {
    Complete,
    Failed(String),
    /// Watch gave no terminal condition (stream error, unclear status,
    /// deadline, cancellation).
    Unclear(String),
}

/// Runs build tasks as Kubernetes Jobs.
pub struct KubernetesExecutor {
    client: kube::Client,
    namespace: String,
    agent_image: String,
    controller_url: String,
    server_config: Option<K8sServerConfig>,
}

impl KubernetesExecutor {
    pub fn new(
        client: kube::Client,
        namespace: String,
        agent_image: String,
        controller_url: String,
        server_config: Option<K8sServerConfig>,
    ) -> Self {
        Self { client, namespace, agent_image, controller_url, server_config }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Watches the named job until it reports a terminal condition.
    async fn wait_job_completion(
        &self,
        state: &BuildState,
        task_id: &str,
        job_name: &str,
    ) -> JobOutcome {
        let jobs = self.jobs();
        let wp = WatchParams::default().fields(&format!("metadata.name={job_name}"));

        let mut stream = match jobs.watch(&wp, "0").await {
            Ok(stream) => stream.boxed(),
            Err(err) => {
                state.append_log(
                    Level::Error,
                    format!("[k8s][{task_id}] watch error: {err}"),
                );
                return self.probe_job_status(&jobs, job_name).await;
            }
        };

        let mut tick = tokio::time::interval(STATUS_POLL_INTERVAL);
        tick.tick().await; // immediate first tick

        loop {
            tokio::select! {
                event = stream.try_next() => match event {
                    Ok(Some(WatchEvent::Modified(job) | WatchEvent::Deleted(job))) => {
                        if let Some(outcome) = terminal_condition(&job) {
                            return outcome;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        // Stream ended without a verdict; take one last look.
                        return self.probe_job_status(&jobs, job_name).await;
                    }
                    Err(err) => {
                        state.append_log(
                            Level::Warn,
                            format!("[k8s][{task_id}] watch stream error: {err}"),
                        );
                        return self.probe_job_status(&jobs, job_name).await;
                    }
                },
                _ = tick.tick() => {
                    if let Ok(job) = jobs.get(job_name).await {
                        let status = job.status.as_ref();
                        state.append_log(
                            Level::Debug,
                            format!(
                                "[k8s][{task_id}] active={} succeeded={} failed={}",
                                status.and_then(|s| s.active).unwrap_or(0),
                                status.and_then(|s| s.succeeded).unwrap_or(0),
                                status.and_then(|s| s.failed).unwrap_or(0),
                            ),
                        );
                    }
                }
            }
        }
    }

    async fn probe_job_status(&self, jobs: &Api<Job>, job_name: &str) -> JobOutcome {
        match jobs.get(job_name).await {
            Ok(job) => {
                terminal_condition(&job).unwrap_or(JobOutcome::Unclear("job status unclear".to_string()))
            }
            Err(err) => JobOutcome::Unclear(format!("get job: {err}")),
        }
    }

    /// Reads the worker container's exit code from the job's pod, then
    /// gives the worker's result callback and ingest stream a bounded
    /// window to land before the supervisor returns. Both waits are soft.
    async fn inspect_pod_exit(
        &self,
        state: &BuildState,
        task_id: &str,
        job_name: &str,
        job_error: Option<String>,
    ) -> Result<(), ExecutorError> {
        let pod_list = match self
            .pods()
            .list(&ListParams::default().labels(&format!("job-name={job_name}")))
            .await
        {
            Ok(list) => list,
            Err(err) => {
                let message = format!("failed to list pods: {err}");
                state.append_log(Level::Error, format!("[k8s][{task_id}] {message}"));
                state.set_error(message.clone());
                return Err(ExecutorError::Remote(message));
            }
        };

        let Some(pod) = pod_list.items.first() else {
            let message = format!("no pods found for job {job_name}");
            state.append_log(Level::Error, format!("[k8s][{task_id}] {message}"));
            state.set_error(message.clone());
            return Err(ExecutorError::Lost(message));
        };

        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
        if phase == "Pending" || phase == "Unknown" {
            let message = format!("pod never started: phase={phase}");
            state.append_log(Level::Error, format!("[k8s][{task_id}] {message}"));
            state.set_error(message.clone());
            return Err(ExecutorError::Lost(message));
        }

        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();
        let Some(agent) = statuses.iter().find(|cs| cs.name == "agent") else {
            let message = "agent container not found in pod".to_string();
            state.append_log(Level::Error, format!("[k8s][{task_id}] {message}"));
            state.set_error(message.clone());
            return Err(ExecutorError::Lost(message));
        };

        let Some(terminated) = agent.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            state.append_log(
                Level::Warn,
                format!("[k8s][{task_id}] agent container not terminated yet"),
            );
            if let Some(message) = job_error {
                state.append_log(Level::Error, format!("[k8s][{task_id}] job error: {message}"));
                state.set_error(message.clone());
                return Err(ExecutorError::Remote(message));
            }
            return Ok(());
        };

        let mut task_error = None;
        if terminated.exit_code != 0 {
            let reason = terminated.reason.as_deref().unwrap_or_default();
            let message = format!("agent exit={}: {reason}", terminated.exit_code);
            state.append_log(Level::Error, format!("[k8s][{task_id}] {message}"));
            state.set_error(message);
            task_error = Some(ExecutorError::AgentExit(terminated.exit_code));
        } else {
            state.append_log(Level::Info, format!("[k8s][{task_id}] exit=0 success"));
        }

        if self
            .drain_wait(RESULT_DRAIN_WAIT, || state.has_result(task_id))
            .await
        {
            state.append_log(Level::Debug, format!("[k8s][{task_id}] result received"));
        } else {
            state.append_log(
                Level::Warn,
                format!("[k8s][{task_id}] result not received after {RESULT_DRAIN_WAIT:?}"),
            );
        }

        if self
            .drain_wait(INGEST_DRAIN_WAIT, || state.ingest_done(task_id))
            .await
        {
            state.append_log(Level::Debug, format!("[k8s][{task_id}] ingest completed"));
        } else {
            state.append_log(
                Level::Warn,
                format!(
                    "[k8s][{task_id}] ingest not confirmed after {INGEST_DRAIN_WAIT:?} (may already be closed)"
                ),
            );
        }

        state.mark_ingest_done(task_id);

        match (task_error, job_error) {
            (Some(err), _) => Err(err),
            (None, Some(message)) => {
                state.set_error(message.clone());
                Err(ExecutorError::Remote(message))
            }
            (None, None) => Ok(()),
        }
    }

    async fn drain_wait(&self, limit: Duration, satisfied: impl Fn() -> bool) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < limit {
            if satisfied() {
                return true;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        satisfied()
    }
}

/// Maps the job's conditions to a terminal outcome, if it has one.
fn terminal_condition(job: &Job) -> Option<JobOutcome> {
    let conditions = job.status.as_ref()?.conditions.as_deref()?;
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Some(JobOutcome::Complete),
            "Failed" => {
                let reason = condition.reason.as_deref().unwrap_or_default();
                return Some(JobOutcome::Failed(format!("job failed: {reason}")));
            }
            _ => {}
        }
    }
    None
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn run_task(
        &self,
        state: Arc<BuildState>,
        task_id: &str,
        config: &EffectiveConfig,
        task: &TaskContext,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        state.append_log(Level::Info, format!("[k8s][{task_id}] dispatching job"));

        let env = worker_env::build(&state, task_id, config, task, &self.controller_url, "k8s")?;

        // Validate the resource requests before shipping them as limits.
        let cpu_limit = if config.cpu.is_empty() {
            String::new()
        } else {
            parse_cpu_units(&config.cpu)?;
            let formatted = format_k8s_cpu(&config.cpu);
            state.append_log(Level::Info, format!("[k8s][{task_id}] cpu limit: {formatted}"));
            formatted
        };
        let memory_limit = if config.memory.is_empty() {
            String::new()
        } else {
            parse_memory_mb(&config.memory)?;
            let formatted = format_k8s_memory(&config.memory);
            state.append_log(Level::Info, format!("[k8s][{task_id}] memory limit: {formatted}"));
            formatted
        };

        let params = job::JobParams {
            name_prefix: format!("build-{}-{}-", state.id(), task_id),
            namespace: self.namespace.clone(),
            image: self.agent_image.clone(),
            build_id: state.id().to_string(),
            task_id: task_id.to_string(),
            arch: config.arch.clone(),
            env,
            cpu_limit,
            memory_limit,
            server: self.server_config.clone(),
        };

        let created = self
            .jobs()
            .create(&PostParams::default(), &job::build_job(&params))
            .await
            .map_err(|e| ExecutorError::Dispatch(format!("create job: {e}")))?;
        let job_name = created.name_any();

        state.record_task_handle(task_id, &job_name);
        state.append_log(Level::Info, format!("[k8s][{task_id}] started job: {job_name}"));

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(
                WATCH_DEADLINE,
                self.wait_job_completion(&state, task_id, &job_name),
            ) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => JobOutcome::Unclear("job watch deadline reached".to_string()),
            },
            _ = cancel.cancelled() => {
                state.append_log(
                    Level::Error,
                    format!("[k8s][{task_id}] supervisor cancelled while watching job"),
                );
                JobOutcome::Unclear("job cancelled by supervisor deadline".to_string())
            }
        };

        let job_error = match outcome {
            JobOutcome::Complete => None,
            JobOutcome::Failed(message) | JobOutcome::Unclear(message) => Some(message),
        };

        // Exit inspection and the drain waits run under a fresh context:
        // even a cancelled supervisor reads the final pod state.
        self.inspect_pod_exit(&state, task_id, &job_name, job_error).await
    }
}

#[cfg(test)]
#[path = "kubernetes_tests.rs"]
mod tests;
