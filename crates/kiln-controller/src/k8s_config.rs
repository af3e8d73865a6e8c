// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-side Kubernetes pod-spec overrides.
//!
//! Cluster operators ship a small YAML file (pointed at by
//! `K8S_CONFIG_PATH`) that customizes worker pods without touching build
//! manifests: pull secrets, service account, node placement.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum K8sConfigError {
    #[error("read k8s config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse k8s config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sServerConfig {
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalSecretRef>,
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<TolerationSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalSecretRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TolerationSpec {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: String,
}

#[derive(Debug, Default, Deserialize)]
struct Wrapper {
    #[serde(default)]
    k8s: K8sServerConfig,
}

/// Loads the config file. The document nests everything under a `k8s`
/// key so the file can be shared with other tooling.
pub fn load(path: &Path) -> Result<K8sServerConfig, K8sConfigError> {
    let data = std::fs::read(path)?;
    let wrapper: Wrapper = serde_yaml::from_slice(&data)?;
    Ok(wrapper.k8s)
}

#[cfg(test)]
#[path = "k8s_config_tests.rs"]
mod tests;
