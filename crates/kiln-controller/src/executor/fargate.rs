// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AWS Fargate executor.
//!
//! One ECS task definition is materialized per (arch, cpu, memory) triple
//! and reused across builds; task runs reference the cached family.
//! Supervision polls `DescribeTasks` until the task stops, then reads the
//! worker container's exit code. The worker's result callback is not
//! awaited here — that wait belongs to the orchestrator's finalizer.

use crate::env;
use crate::executor::{worker_env, Executor, ExecutorError, TaskContext};
use async_trait::async_trait;
use aws_sdk_ecs::error::DisplayErrorContext;
use aws_sdk_ecs::types::{
    AwsVpcConfiguration, Compatibility, ContainerDefinition, ContainerOverride, CpuArchitecture,
    KeyValuePair, LaunchType, LogConfiguration, LogDriver, NetworkConfiguration, NetworkMode,
    OsFamily, RepositoryCredentials, RuntimePlatform, TaskDefinitionFamilyStatus,
    TaskDefinitionStatus, TaskOverride,
};
use kiln_core::manifest::EffectiveConfig;
use kiln_core::resources::{normalize_fargate, validate_fargate};
use kiln_core::state::{BuildState, Level};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const DESCRIBE_POLL_INTERVAL: Duration = Duration::from_secs(3);
const REGISTER_RACE_BACKOFF: Duration = Duration::from_millis(500);

/// Static configuration for the Fargate executor, normally read from the
/// process environment.
#[derive(Debug, Clone, Default)]
pub struct FargateConfig {
    pub cluster: String,
    pub region: String,
    pub agent_image: String,
    pub execution_role: String,
    pub task_role: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub registry_secret_arn: Option<String>,
    pub controller_url: String,
    pub task_family_prefix: String,
    pub log_group: Option<String>,
}

impl FargateConfig {
    pub fn from_env() -> Self {
        Self {
            cluster: env::ecs_cluster(),
            region: env::aws_region(),
            agent_image: env::agent_image(),
            execution_role: env::ecs_exec_role_arn(),
            task_role: env::ecs_task_role_arn(),
            subnets: env::ecs_subnets(),
            security_groups: env::ecs_security_groups(),
            registry_secret_arn: env::agent_image_secret_arn(),
            controller_url: env::controller_url(),
            task_family_prefix: env::agent_task_family(),
            log_group: env::ecs_log_group(),
        }
    }
}

/// Runs build tasks on AWS Fargate.
pub struct FargateExecutor {
    client: aws_sdk_ecs::Client,
    config: FargateConfig,
    // Families known to exist. The async mutex intentionally serializes
    // the whole cache-miss path (describe + register).
    task_def_cache: Mutex<HashSet<String>>,
}

impl FargateExecutor {
    pub fn new(client: aws_sdk_ecs::Client, config: FargateConfig) -> Self {
        Self { client, config, task_def_cache: Mutex::new(HashSet::new()) }
    }

    /// Deregisters every ACTIVE task definition under the family prefix.
    /// Invoked at startup when `CLEANUP_ECS_TASK_DEFINITIONS=true`.
    pub async fn cleanup_task_definitions(
        client: &aws_sdk_ecs::Client,
        family_prefix: &str,
    ) -> Result<usize, ExecutorError> {
        let families = client
            .list_task_definition_families()
            .family_prefix(family_prefix)
            .status(TaskDefinitionFamilyStatus::Active)
            .send()
            .await
            .map_err(|e| {
                ExecutorError::Remote(format!(
                    "list task definition families: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let mut deregistered = 0;
        for family in families.families() {
            let defs = match client
                .list_task_definitions()
                .family_prefix(family)
                .status(TaskDefinitionStatus::Active)
                .send()
                .await
            {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!(%family, error = %DisplayErrorContext(&e), "listing task definitions failed");
                    continue;
                }
            };

            for arn in defs.task_definition_arns() {
                match client.deregister_task_definition().task_definition(arn).send().await {
                    Ok(_) => deregistered += 1,
                    Err(e) => {
                        tracing::warn!(%arn, error = %DisplayErrorContext(&e), "deregister failed");
                    }
                }
            }
        }

        Ok(deregistered)
    }

    /// Returns the task-definition family for (arch, cpu, memory),
    /// registering it on first use. Registration races with concurrent
    /// controllers resolve by re-describing after a short backoff.
    async fn ensure_task_definition(
        &self,
        arch: &str,
        cpu: &str,
        memory: &str,
    ) -> Result<String, ExecutorError> {
        let cpu = if cpu.is_empty() { "256" } else { cpu };
        let memory = if memory.is_empty() { "512" } else { memory };

        let (cpu_norm, mem_norm) = normalize_fargate(cpu, memory)?;
        validate_fargate(cpu_norm, mem_norm)?;

        let family =
            format!("{}-{}-{}-{}", self.config.task_family_prefix, arch, cpu_norm, mem_norm);

        let mut cache = self.task_def_cache.lock().await;
        if cache.contains(&family) {
            return Ok(family);
        }

        if self
            .client
            .describe_task_definition()
            .task_definition(&family)
            .send()
            .await
            .is_ok()
        {
            cache.insert(family.clone());
            return Ok(family);
        }

        let cpu_arch = match arch {
            "amd64" => CpuArchitecture::X8664,
            "arm64" => CpuArchitecture::Arm64,
            other => {
                return Err(ExecutorError::Dispatch(format!("unsupported fargate arch: {other}")))
            }
        };

        tracing::info!(%family, arch, cpu = cpu_norm, memory = mem_norm, "registering task definition");

        let mut container = ContainerDefinition::builder()
            .name("agent")
            .image(&self.config.agent_image)
            .essential(true);

        if let Some(arn) = &self.config.registry_secret_arn {
            let credentials = RepositoryCredentials::builder()
                .credentials_parameter(arn)
                .build()
                .map_err(|e| ExecutorError::Dispatch(format!("repository credentials: {e}")))?;
            container = container.repository_credentials(credentials);
        }

        if let Some(log_group) = &self.config.log_group {
            let log_config = LogConfiguration::builder()
                .log_driver(LogDriver::Awslogs)
                .options("awslogs-group", log_group)
                .options("awslogs-region", &self.config.region)
                .options("awslogs-stream-prefix", "agent")
                .build()
                .map_err(|e| ExecutorError::Dispatch(format!("log configuration: {e}")))?;
            container = container.log_configuration(log_config);
        }

        let register = self
            .client
            .register_task_definition()
            .family(&family)
            .cpu(cpu_norm.to_string())
            .memory(mem_norm.to_string())
            .network_mode(NetworkMode::Awsvpc)
            .requires_compatibilities(Compatibility::Fargate)
            .execution_role_arn(&self.config.execution_role)
            .task_role_arn(&self.config.task_role)
            .runtime_platform(
                RuntimePlatform::builder()
                    .cpu_architecture(cpu_arch)
                    .operating_system_family(OsFamily::Linux)
                    .build(),
            )
            .container_definitions(container.build())
            .send()
            .await;

        match register {
            Ok(_) => {
                cache.insert(family.clone());
                Ok(family)
            }
            Err(err) => {
                let message = format!("{}", DisplayErrorContext(&err));
                if message.contains("Too many concurrent attempts")
                    || message.contains("ResourceInUseException")
                {
                    // Another registration for the same family is in
                    // flight; give it a beat and re-describe.
                    tokio::time::sleep(REGISTER_RACE_BACKOFF).await;
                    if self
                        .client
                        .describe_task_definition()
                        .task_definition(&family)
                        .send()
                        .await
                        .is_ok()
                    {
                        cache.insert(family.clone());
                        return Ok(family);
                    }
                }
                Err(ExecutorError::Dispatch(format!("register task definition: {message}")))
            }
        }
    }

    async fn wait_task_stopped(
        &self,
        state: &BuildState,
        task_id: &str,
        task_arn: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ExecutorError::Timeout(format!(
                        "deadline reached waiting for fargate task {task_id}"
                    )));
                }
                _ = tokio::time::sleep(DESCRIBE_POLL_INTERVAL) => {}
            }

            let described = match self
                .client
                .describe_tasks()
                .cluster(&self.config.cluster)
                .tasks(task_arn)
                .send()
                .await
            {
                Ok(out) => out,
                Err(e) => {
                    state.append_log(
                        Level::Error,
                        format!("[fargate][{task_id}] describe error: {}", DisplayErrorContext(&e)),
                    );
                    continue;
                }
            };

            let Some(task) = described.tasks().first() else { continue };
            if let Some(status) = task.last_status() {
                state.append_log(Level::Debug, format!("[fargate][{task_id}] status={status}"));
                if status == "STOPPED" {
                    return Ok(());
                }
            }
        }
    }

    /// Reads the worker container's exit code from the stopped task.
    async fn check_task_exit(
        &self,
        state: &BuildState,
        task_arn: &str,
    ) -> Result<(), ExecutorError> {
        let task_id =
            state.task_for_handle(task_arn).unwrap_or_else(|| "unknown".to_string());

        let described = self
            .client
            .describe_tasks()
            .cluster(&self.config.cluster)
            .tasks(task_arn)
            .send()
            .await
            .map_err(|e| {
                let message = format!("describe stopped task: {}", DisplayErrorContext(&e));
                state.append_log(Level::Error, format!("[fargate][{task_id}] {message}"));
                state.set_error(message.clone());
                ExecutorError::Remote(message)
            })?;

        let Some(task) = described.tasks().first() else {
            let message = "no task info".to_string();
            state.set_error(message.clone());
            return Err(ExecutorError::Lost(message));
        };

        for container in task.containers() {
            if container.name() == Some("agent") {
                let exit = container.exit_code().unwrap_or(0);
                if exit != 0 {
                    state.set_error(format!("agent exit={exit}"));
                    state.append_log(Level::Error, format!("[fargate][{task_id}] exit={exit}"));
                    return Err(ExecutorError::AgentExit(exit));
                }
                state.append_log(Level::Info, format!("[fargate][{task_id}] exit=0 success"));
                return Ok(());
            }
        }

        let message = "agent container not found".to_string();
        state.set_error(message.clone());
        Err(ExecutorError::Lost(message))
    }
}

#[async_trait]
impl Executor for FargateExecutor {
    async fn run_task(
        &self,
        state: Arc<BuildState>,
        task_id: &str,
        config: &EffectiveConfig,
        task: &TaskContext,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        if config.arch.is_empty() {
            return Err(ExecutorError::Dispatch("missing arch".to_string()));
        }

        let family =
            self.ensure_task_definition(&config.arch, &config.cpu, &config.memory).await?;
        state.append_log(
            Level::Info,
            format!(
                "[fargate][{task_id}] task definition = {family} (cpu={} memory={})",
                config.cpu, config.memory
            ),
        );

        let vars = worker_env::build(
            &state,
            task_id,
            config,
            task,
            &self.config.controller_url,
            "ecs",
        )?;
        let environment: Vec<KeyValuePair> = vars
            .into_iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();

        let network = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(Some(self.config.security_groups.clone()))
            .build()
            .map_err(|e| ExecutorError::Dispatch(format!("network configuration: {e}")))?;

        let overrides = TaskOverride::builder()
            .container_overrides(
                ContainerOverride::builder()
                    .name("agent")
                    .set_environment(Some(environment))
                    .build(),
            )
            .build();

        let run = self
            .client
            .run_task()
            .cluster(&self.config.cluster)
            .task_definition(&family)
            .launch_type(LaunchType::Fargate)
            .count(1)
            .platform_version("LATEST")
            .network_configuration(
                NetworkConfiguration::builder().awsvpc_configuration(network).build(),
            )
            .overrides(overrides)
            .send()
            .await
            .map_err(|e| {
                ExecutorError::Dispatch(format!("run task: {}", DisplayErrorContext(&e)))
            })?;

        let task_arn = run
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .ok_or_else(|| ExecutorError::Dispatch("run task returned no tasks".to_string()))?
            .to_string();

        state.record_task_handle(task_id, &task_arn);
        state.append_log(Level::Info, format!("[fargate][{task_id}] started task: {task_arn}"));

        self.wait_task_stopped(&state, task_id, &task_arn, &cancel).await?;
        self.check_task_exit(&state, &task_arn).await
    }
}

#[cfg(test)]
#[path = "fargate_tests.rs"]
mod tests;
