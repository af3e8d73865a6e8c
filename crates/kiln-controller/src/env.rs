// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the controller crate.

use kiln_core::manifest::Defaults;
use std::time::Duration;

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

pub fn aws_region() -> String {
    var_or("AWS_REGION", "us-east-1")
}

pub fn ecs_cluster() -> String {
    var_or("ECS_CLUSTER", "build-cluster")
}

pub fn ecs_subnets() -> Vec<String> {
    var("ECS_SUBNETS").map(|v| split_list(&v)).unwrap_or_default()
}

pub fn ecs_security_groups() -> Vec<String> {
    var("ECS_SECURITY_GROUPS").map(|v| split_list(&v)).unwrap_or_default()
}

pub fn ecs_exec_role_arn() -> String {
    var("ECS_EXEC_ROLE_ARN").unwrap_or_default()
}

pub fn ecs_task_role_arn() -> String {
    var("ECS_TASK_ROLE_ARN").unwrap_or_default()
}

/// CloudWatch log group for worker containers. Absent means no log driver
/// is attached to registered task definitions.
pub fn ecs_log_group() -> Option<String> {
    var("ECS_LOG_GROUP")
}

pub fn agent_image() -> String {
    var("AGENT_IMAGE").unwrap_or_default()
}

/// Secrets Manager ARN for pulling the worker image from a private
/// registry. Creating the secret is provisioning and out of scope; the
/// controller only references it.
pub fn agent_image_secret_arn() -> Option<String> {
    var("AGENT_IMAGE_SECRET_ARN")
}

pub fn agent_task_family() -> String {
    var_or("AGENT_TASK_FAMILY", "build-agent")
}

pub fn cleanup_task_definitions() -> bool {
    var("CLEANUP_ECS_TASK_DEFINITIONS").as_deref() == Some("true")
}

pub fn k8s_namespace() -> String {
    var_or("K8S_NAMESPACE", "default")
}

/// Server-side pod-spec override file. Unset means default pod settings;
/// it does not disable Kubernetes dispatch.
pub fn k8s_config_path() -> Option<String> {
    var("K8S_CONFIG_PATH")
}

/// Public base URL of this controller, embedded into worker environments
/// for log ingest and result callbacks.
pub fn controller_url() -> String {
    var("CONTROLLER_URL").unwrap_or_default()
}

/// Bucket holding uploaded build contexts.
pub fn context_bucket() -> Option<String> {
    var("S3_BUCKET")
}

/// Object-storage settings forwarded verbatim to workers.
#[derive(Debug, Clone, Default)]
pub struct StorageEnv {
    pub endpoint: String,
    pub region: String,
    pub use_ssl: String,
    pub access_key: String,
    pub secret_key: String,
}

pub fn storage_env() -> StorageEnv {
    StorageEnv {
        endpoint: var("S3_ENDPOINT").unwrap_or_default(),
        region: var("S3_REGION").unwrap_or_default(),
        use_ssl: var("S3_SSL").unwrap_or_default(),
        access_key: var("S3_ACCESS_KEY").unwrap_or_default(),
        secret_key: var("S3_SECRET_KEY").unwrap_or_default(),
    }
}

fn duration_secs(key: &str, default: Duration) -> Duration {
    var(key).and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
}

/// Per-supervisor deadline, seconds (default 30 minutes).
pub fn build_task_timeout() -> Duration {
    duration_secs("BUILD_TASK_TIMEOUT", Duration::from_secs(30 * 60))
}

/// Finalizer's bounded wait for outstanding results, seconds (default 60).
pub fn build_result_timeout() -> Duration {
    duration_secs("BUILD_RESULT_TIMEOUT", Duration::from_secs(60))
}

/// Fallback CPU/memory requests for manifests that specify neither.
pub fn build_defaults() -> Defaults {
    Defaults { cpu: var("DEFAULT_BUILD_CPU"), memory: var("DEFAULT_BUILD_MEMORY") }
}

/// Shared opaque token required on inbound build routes when set.
pub fn auth_token() -> Option<String> {
    var("CONTROLLER_AUTH_TOKEN")
}

pub fn server_port() -> u16 {
    var("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000)
}

pub fn server_log_level() -> Option<String> {
    var("SERVER_LOG_LEVEL")
}
