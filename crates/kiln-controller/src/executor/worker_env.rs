// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker environment assembly.
//!
//! The environment variable list is the only machine-readable interface
//! between the controller and the worker image. Both executors hand the
//! same list to their substrate, each in its own wire shape.

use crate::env::{self, StorageEnv};
use crate::executor::{ExecutorError, TaskContext};
use base64::Engine as _;
use kiln_core::manifest::{EffectiveConfig, RegistryCredential};
use kiln_core::reference::{append_arch_suffix, append_task_suffix};
use kiln_core::state::BuildState;
use serde::Serialize;
use std::collections::BTreeMap;

/// Target platform pieces derived from the arch tag or an explicit
/// custom-platform override.
pub(crate) struct TargetPlatform {
    pub platform: String,
    pub os: String,
    pub arch: String,
    pub variant: String,
}

pub(crate) fn target_platform(config: &EffectiveConfig) -> TargetPlatform {
    if let Some(custom) = config.custom_platform.as_deref().filter(|p| !p.is_empty()) {
        let parts: Vec<&str> = custom.split('/').collect();
        if parts.len() >= 2 {
            return TargetPlatform {
                platform: custom.to_string(),
                os: parts[0].to_string(),
                arch: parts[1].to_string(),
                variant: parts.get(2).map(|v| v.to_string()).unwrap_or_default(),
            };
        }
        return TargetPlatform {
            platform: custom.to_string(),
            os: "linux".to_string(),
            arch: config.arch.clone(),
            variant: String::new(),
        };
    }

    TargetPlatform {
        platform: format!("linux/{}", config.arch),
        os: "linux".to_string(),
        arch: config.arch.clone(),
        variant: if config.arch == "arm64" { "v8".to_string() } else { String::new() },
    }
}

/// Resolves the image reference a worker pushes to.
///
/// Single-arch builds push to the explicit destination or the global one.
/// Multi-arch builds push per-target images: an explicit destination that
/// differs from the global target is honored; anything else gets the
/// global destination with a `_<arch>` (or `_<taskid>`) tag suffix so the
/// per-target pushes cannot clobber the manifest-list tag.
pub(crate) fn push_destination(
    state: &BuildState,
    config: &EffectiveConfig,
    task_id: &str,
) -> String {
    let explicit = config.destination.as_deref().filter(|d| !d.is_empty());
    let global = state.global_destination();

    if state.is_single_arch() {
        return explicit.unwrap_or(global).to_string();
    }

    match explicit {
        Some(dest) if dest != global => dest.to_string(),
        _ => {
            if state.has_duplicate_arch() {
                append_task_suffix(global, task_id)
            } else {
                append_arch_suffix(global, &config.arch)
            }
        }
    }
}

#[derive(Serialize)]
struct DockerAuth {
    auth: String,
}

#[derive(Serialize)]
struct DockerConfig {
    auths: BTreeMap<String, DockerAuth>,
}

/// Renders registry credentials as a docker `config.json` blob for the
/// worker's image builder.
pub(crate) fn docker_config_json(
    credentials: &[RegistryCredential],
) -> Result<String, ExecutorError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let auths = credentials
        .iter()
        .map(|cred| {
            let auth = engine.encode(format!("{}:{}", cred.username, cred.password));
            (cred.registry.clone(), DockerAuth { auth })
        })
        .collect();

    serde_json::to_string(&DockerConfig { auths })
        .map_err(|e| ExecutorError::Dispatch(format!("create docker config: {e}")))
}

/// Terminal color index for interleaved client output: amd64 tasks take
/// even indices, arm64 tasks odd ones.
pub(crate) fn task_color_index(task_id: &str) -> String {
    match task_id {
        "amd64" => return "0".to_string(),
        "arm64" => return "1".to_string(),
        _ => {}
    }

    if let Some((arch, index)) = task_id.split_once('-') {
        if let Ok(n) = index.parse::<u32>() {
            match arch {
                "amd64" => return (n * 2).to_string(),
                "arm64" => return (n * 2 + 1).to_string(),
                _ => {}
            }
        }
    }

    "0".to_string()
}

/// Builds the full worker environment for one task.
pub(crate) fn build(
    state: &BuildState,
    task_id: &str,
    config: &EffectiveConfig,
    task: &TaskContext,
    controller_url: &str,
    executor_platform: &str,
) -> Result<Vec<(String, String)>, ExecutorError> {
    let target = target_platform(config);
    let destination = push_destination(state, config, task_id);
    let storage: StorageEnv = env::storage_env();

    let mut vars: Vec<(String, String)> = vec![
        ("BUILD_ID".into(), state.id().to_string()),
        ("BUILD_TASK_ID".into(), task_id.to_string()),
        ("TASK_COLOR_INDEX".into(), task_color_index(task_id)),
        ("TARGETPLATFORM".into(), target.platform.clone()),
        ("TARGETOS".into(), target.os.clone()),
        ("TARGETARCH".into(), target.arch.clone()),
        ("TARGETVARIANT".into(), target.variant.clone()),
        ("BUILDPLATFORM".into(), target.platform),
        ("BUILDOS".into(), target.os),
        ("BUILDARCH".into(), target.arch),
        ("BUILDVARIANT".into(), target.variant),
        ("EXECUTOR_PLATFORM".into(), executor_platform.to_string()),
        ("STORAGE_ENDPOINT".into(), storage.endpoint),
        ("STORAGE_REGION".into(), storage.region),
        ("STORAGE_USE_SSL".into(), storage.use_ssl),
        ("STORAGE_ACCESS_KEY".into(), storage.access_key),
        ("STORAGE_SECRET_KEY".into(), storage.secret_key),
        ("CONTEXT_BUCKET".into(), task.context_bucket.clone()),
        ("CONTEXT_KEY".into(), task.context_key.clone()),
        ("CONTROLLER_URL".into(), controller_url.to_string()),
        ("INGEST_URL".into(), task.ingest_url.clone()),
        ("KANIKO_DESTINATION".into(), destination),
        ("KANIKO_CONTEXT".into(), config.context_path.clone()),
        ("KANIKO_DOCKERFILE".into(), config.dockerfile.clone()),
    ];

    if !config.build_args.is_empty() {
        let pairs: Vec<String> =
            config.build_args.iter().map(|(k, v)| format!("{k}={v}")).collect();
        vars.push(("KANIKO_BUILD_ARGS".into(), pairs.join(",")));
    }

    if !config.credentials.is_empty() {
        vars.push(("KANIKO_CREDENTIALS_JSON".into(), docker_config_json(&config.credentials)?));
    }

    if let Some(enable) = config.cache.enable {
        vars.push(("KANIKO_CACHE_ENABLE".into(), enable.to_string()));
    }
    if let Some(repo) = config.cache.repo.as_deref().filter(|v| !v.is_empty()) {
        vars.push(("KANIKO_CACHE_REPO".into(), repo.to_string()));
    }
    if let Some(ttl) = config.cache.ttl.as_deref().filter(|v| !v.is_empty()) {
        vars.push(("KANIKO_CACHE_TTL".into(), ttl.to_string()));
    }
    if let Some(copy_layers) = config.cache.copy_layers {
        vars.push(("KANIKO_CACHE_COPY_LAYERS".into(), copy_layers.to_string()));
    }
    if let Some(run_layers) = config.cache.run_layers {
        vars.push(("KANIKO_CACHE_RUN_LAYERS".into(), run_layers.to_string()));
    }
    if let Some(compressed) = config.cache.compressed {
        vars.push(("KANIKO_CACHE_COMPRESSED".into(), compressed.to_string()));
    }

    if let Some(mode) = &config.snapshot_mode {
        vars.push(("KANIKO_SNAPSHOT_MODE".into(), mode.clone()));
    }
    if let Some(use_new_run) = config.use_new_run {
        vars.push(("KANIKO_USE_NEW_RUN".into(), use_new_run.to_string()));
    }
    if let Some(cleanup) = config.cleanup {
        vars.push(("KANIKO_CLEANUP".into(), cleanup.to_string()));
    }
    if let Some(custom) = &config.custom_platform {
        vars.push(("KANIKO_CUSTOM_PLATFORM".into(), custom.clone()));
    }
    if let Some(no_push) = config.no_push {
        vars.push(("KANIKO_NO_PUSH".into(), no_push.to_string()));
    }
    if !config.ignore_paths.is_empty() {
        vars.push(("KANIKO_IGNORE_PATH".into(), config.ignore_paths.join(",")));
    }
    if let Some(flags) = config.extra_flags.as_deref().filter(|v| !v.is_empty()) {
        vars.push(("KANIKO_EXTRA_FLAGS".into(), flags.to_string()));
    }

    if let Some(script) = &config.pre_script {
        vars.push(("PRE_SCRIPT".into(), script.clone()));
    }
    if let Some(script) = &config.post_script {
        vars.push(("POST_SCRIPT".into(), script.clone()));
    }

    for (key, value) in &config.env {
        vars.push((key.clone(), value.clone()));
    }

    Ok(vars)
}

#[cfg(test)]
#[path = "worker_env_tests.rs"]
mod tests;
