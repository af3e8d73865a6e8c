// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job spec construction for Kubernetes build tasks.

use crate::k8s_config::K8sServerConfig;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Parameters for building one build-task Job.
pub(super) struct JobParams {
    /// `generateName` prefix, `build-<build-id>-<task-id>-`.
    pub name_prefix: String,
    pub namespace: String,
    pub image: String,
    pub build_id: String,
    pub task_id: String,
    pub arch: String,
    pub env: Vec<(String, String)>,
    /// Kubernetes quantity strings; empty means no limit.
    pub cpu_limit: String,
    pub memory_limit: String,
    /// Server-side pod-spec overrides (None = defaults).
    pub server: Option<K8sServerConfig>,
}

/// Jobs are one-shot: no retries, cleaned up half an hour after they
/// finish.
const TTL_AFTER_FINISHED_SECONDS: i32 = 1800;

pub(super) fn build_job(params: &JobParams) -> Job {
    let mut limits: BTreeMap<String, Quantity> = BTreeMap::new();
    if !params.cpu_limit.is_empty() {
        limits.insert("cpu".to_string(), Quantity(params.cpu_limit.clone()));
    }
    if !params.memory_limit.is_empty() {
        limits.insert("memory".to_string(), Quantity(params.memory_limit.clone()));
    }

    let env: Vec<EnvVar> = params
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: "agent".to_string(),
        image: Some(params.image.clone()),
        env: Some(env),
        resources: if limits.is_empty() {
            None
        } else {
            Some(ResourceRequirements { limits: Some(limits), ..Default::default() })
        },
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        containers: vec![container],
        ..Default::default()
    };
    apply_server_pod_spec(&mut pod_spec, params.server.as_ref(), &params.arch);

    Job {
        metadata: ObjectMeta {
            generate_name: Some(params.name_prefix.clone()),
            namespace: Some(params.namespace.clone()),
            labels: Some(
                [
                    ("build-id".to_string(), params.build_id.clone()),
                    ("task-id".to_string(), params.task_id.clone()),
                    ("arch".to_string(), params.arch.clone()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec { metadata: None, spec: Some(pod_spec) },
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(TTL_AFTER_FINISHED_SECONDS),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Applies the operator-supplied pod settings, falling back to defaults.
/// The arch node selector is always present unless the operator pinned
/// one themselves.
fn apply_server_pod_spec(pod_spec: &mut PodSpec, server: Option<&K8sServerConfig>, arch: &str) {
    let mut service_account = "default".to_string();
    let mut node_selector: BTreeMap<String, String> = BTreeMap::new();

    if let Some(cfg) = server {
        if let Some(name) = cfg.service_account_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                service_account = name.to_string();
            }
        }

        node_selector.extend(cfg.node_selector.iter().map(|(k, v)| (k.clone(), v.clone())));

        if !cfg.tolerations.is_empty() {
            let tolerations: Vec<Toleration> = cfg
                .tolerations
                .iter()
                .map(|t| Toleration {
                    key: some_nonempty(&t.key),
                    value: some_nonempty(&t.value),
                    effect: some_nonempty(&t.effect),
                    operator: Some(if t.operator.trim().is_empty() {
                        "Exists".to_string()
                    } else {
                        t.operator.clone()
                    }),
                    ..Default::default()
                })
                .collect();
            pod_spec.tolerations = Some(tolerations);
        }

        let pull_secrets: Vec<LocalObjectReference> = cfg
            .image_pull_secrets
            .iter()
            .filter(|s| !s.name.trim().is_empty())
            .map(|s| LocalObjectReference { name: s.name.trim().to_string() })
            .collect();
        if !pull_secrets.is_empty() {
            pod_spec.image_pull_secrets = Some(pull_secrets);
        }
    }

    node_selector
        .entry("kubernetes.io/arch".to_string())
        .or_insert_with(|| arch.to_string());

    pod_spec.service_account_name = Some(service_account);
    pod_spec.node_selector = Some(node_selector);
}

fn some_nonempty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
