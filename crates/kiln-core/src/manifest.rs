// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bake-manifest schema and the global/target merge.
//!
//! A manifest is a YAML document with a `global` block and a `bake` list.
//! Each bake entry produces one [`EffectiveConfig`] — the fully merged
//! build plan for a single worker. Merge precedence is per-field: the bake
//! entry wins where it speaks, the global block fills the rest.
//!
//! Override fields that must distinguish "absent" from "explicit null"
//! are modeled as `Option<Option<T>>`: the outer `Option` is presence in
//! the document, the inner one is the value (`~` clears an inherited
//! setting).

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use thiserror::Error;

/// Architectures that can appear in a manifest-list platform descriptor.
pub const KNOWN_ARCHES: &[&str] = &["amd64", "arm64", "arm", "386", "ppc64le", "s390x"];

/// Errors from manifest parsing and resolution. No partial plans are
/// produced: the first failing bake entry aborts the whole resolve.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("bake[{index}]: arch not specified in either global or bake section")]
    MissingArch { index: usize },

    #[error("bake[{index}]: unknown arch {arch:?}")]
    UnknownArch { index: usize, arch: String },
}

/// Execution substrate for one build task. A closed set: any other value
/// in the manifest is a validation error at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ecs,
    K8s,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Ecs => f.write_str("ecs"),
            Platform::K8s => f.write_str("k8s"),
        }
    }
}

/// Registry credential forwarded to the worker's image builder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildManifest {
    #[serde(default)]
    pub global: GlobalSpec,
    #[serde(default)]
    pub bake: Vec<TargetSpec>,
}

/// The `global` block: defaults shared by every bake entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GlobalSpec {
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub pre_script: Option<String>,
    #[serde(default)]
    pub post_script: Option<String>,
    #[serde(default)]
    pub kaniko_credentials: Vec<RegistryCredential>,
    #[serde(default)]
    pub kaniko: ImageSpec,
}

/// The `kaniko` sub-document of the global block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageSpec {
    #[serde(default)]
    pub context_path: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub cache: CacheSpec,
    #[serde(default)]
    pub snapshot_mode: Option<String>,
    #[serde(default)]
    pub use_new_run: Option<bool>,
    #[serde(default)]
    pub cleanup: Option<bool>,
    #[serde(default)]
    pub custom_platform: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub no_push: Option<bool>,
    #[serde(default)]
    pub ignore_path: Vec<String>,
    #[serde(default)]
    pub extra_flags: Option<String>,
}

/// Layer-cache settings, every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheSpec {
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub ttl: Option<String>,
    #[serde(default)]
    pub copy_layers: Option<bool>,
    #[serde(default)]
    pub run_layers: Option<bool>,
    #[serde(default)]
    pub compressed: Option<bool>,
}

/// One `bake` entry: per-target overrides of the global block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetSpec {
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub pre_script: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub post_script: Option<Option<String>>,
    #[serde(default)]
    pub kaniko_credentials: Vec<RegistryCredential>,
    #[serde(default)]
    pub kaniko: ImageOverride,
}

/// The `kaniko` sub-document of a bake entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageOverride {
    #[serde(default, deserialize_with = "present")]
    pub context_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub dockerfile: Option<Option<String>>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub cache: Option<CacheOverride>,
    #[serde(default, deserialize_with = "present")]
    pub snapshot_mode: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub use_new_run: Option<Option<bool>>,
    #[serde(default, deserialize_with = "present")]
    pub cleanup: Option<Option<bool>>,
    #[serde(default, deserialize_with = "present")]
    pub custom_platform: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub destination: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub no_push: Option<Option<bool>>,
    #[serde(default)]
    pub ignore_path: Vec<String>,
    #[serde(default, deserialize_with = "present")]
    pub extra_flags: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheOverride {
    #[serde(default, deserialize_with = "present")]
    pub enable: Option<Option<bool>>,
    #[serde(default, deserialize_with = "present")]
    pub repo: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub ttl: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub copy_layers: Option<Option<bool>>,
    #[serde(default, deserialize_with = "present")]
    pub run_layers: Option<Option<bool>>,
    #[serde(default, deserialize_with = "present")]
    pub compressed: Option<Option<bool>>,
}

/// Deserializes a field that was present in the document, keeping explicit
/// null distinct from an absent key (absent keys never reach this function
/// and fall back to the `None` default).
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Fallback CPU/memory requests applied when neither the bake entry nor
/// the global block provides them. Captured from `DEFAULT_BUILD_CPU` /
/// `DEFAULT_BUILD_MEMORY` by the controller, injectable in tests.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Resolved cache settings carried on an [`EffectiveConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSettings {
    pub enable: Option<bool>,
    pub repo: Option<String>,
    pub ttl: Option<String>,
    pub copy_layers: Option<bool>,
    pub run_layers: Option<bool>,
    pub compressed: Option<bool>,
}

/// The fully merged build plan for one target. Immutable once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub platform: Platform,
    pub arch: String,
    pub env: BTreeMap<String, String>,
    /// CPU request; empty string is permitted and resolved downstream.
    pub cpu: String,
    /// Memory request; empty string is permitted and resolved downstream.
    pub memory: String,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    pub credentials: Vec<RegistryCredential>,
    pub context_path: String,
    pub dockerfile: String,
    pub build_args: BTreeMap<String, String>,
    /// Per-target destination. `None` signals that the global destination
    /// is the multi-arch target and the per-arch suffix rule applies.
    pub destination: Option<String>,
    pub cache: CacheSettings,
    pub snapshot_mode: Option<String>,
    pub use_new_run: Option<bool>,
    pub cleanup: Option<bool>,
    pub custom_platform: Option<String>,
    pub no_push: Option<bool>,
    pub ignore_paths: Vec<String>,
    pub extra_flags: Option<String>,
}

impl EffectiveConfig {
    /// A pushing task participates in manifest assembly: its no-push flag
    /// is unset or false.
    pub fn is_pushing(&self) -> bool {
        self.no_push != Some(true)
    }
}

/// Parses manifest bytes into the raw document.
pub fn parse(bytes: &[u8]) -> Result<BuildManifest, ManifestError> {
    Ok(serde_yaml::from_slice(bytes)?)
}

/// Merges the global block into every bake entry, in source order.
pub fn resolve(
    manifest: &BuildManifest,
    defaults: &Defaults,
) -> Result<Vec<EffectiveConfig>, ManifestError> {
    let global = &manifest.global;
    let mut list = Vec::with_capacity(manifest.bake.len());

    for (index, target) in manifest.bake.iter().enumerate() {
        let platform = target
            .platform
            .or(global.platform)
            .unwrap_or(Platform::Ecs);

        let arch = match target.arch.as_deref().or(global.arch.as_deref()) {
            Some(a) if !a.trim().is_empty() => a.trim().to_string(),
            _ => return Err(ManifestError::MissingArch { index }),
        };
        if !KNOWN_ARCHES.contains(&arch.as_str()) {
            return Err(ManifestError::UnknownArch { index, arch });
        }

        let cpu = coalesce(&[
            target.cpu.as_deref(),
            global.cpu.as_deref(),
            defaults.cpu.as_deref(),
        ]);
        let memory = coalesce(&[
            target.memory.as_deref(),
            global.memory.as_deref(),
            defaults.memory.as_deref(),
        ]);

        let mut env = global.env.clone();
        env.extend(target.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let pre_script = over(&target.pre_script, &global.pre_script);
        let post_script = over(&target.post_script, &global.post_script);

        // All-or-nothing: a non-empty bake list fully replaces the global
        // one; there is no element-wise merge.
        let credentials = if target.kaniko_credentials.is_empty() {
            global.kaniko_credentials.clone()
        } else {
            target.kaniko_credentials.clone()
        };
        let ignore_paths = if target.kaniko.ignore_path.is_empty() {
            global.kaniko.ignore_path.clone()
        } else {
            target.kaniko.ignore_path.clone()
        };

        let gk = &global.kaniko;
        let tk = &target.kaniko;

        let mut build_args = gk.build_args.clone();
        build_args.extend(tk.build_args.iter().map(|(k, v)| (k.clone(), v.clone())));

        let cache = match &tk.cache {
            Some(tc) => CacheSettings {
                enable: over(&tc.enable, &gk.cache.enable),
                repo: over(&tc.repo, &gk.cache.repo),
                ttl: over(&tc.ttl, &gk.cache.ttl),
                copy_layers: over(&tc.copy_layers, &gk.cache.copy_layers),
                run_layers: over(&tc.run_layers, &gk.cache.run_layers),
                compressed: over(&tc.compressed, &gk.cache.compressed),
            },
            // No cache sub-document on the bake entry: inherit the whole
            // global cache block.
            None => CacheSettings {
                enable: gk.cache.enable,
                repo: gk.cache.repo.clone(),
                ttl: gk.cache.ttl.clone(),
                copy_layers: gk.cache.copy_layers,
                run_layers: gk.cache.run_layers,
                compressed: gk.cache.compressed,
            },
        };

        list.push(EffectiveConfig {
            platform,
            arch,
            env,
            cpu,
            memory,
            pre_script,
            post_script,
            credentials,
            context_path: over(&tk.context_path, &gk.context_path).unwrap_or_default(),
            dockerfile: over(&tk.dockerfile, &gk.dockerfile).unwrap_or_default(),
            build_args,
            // Intentionally *not* inherited from global: an absent
            // destination marks the global destination as the multi-arch
            // target for this task.
            destination: target.kaniko.destination.clone().flatten(),
            cache,
            snapshot_mode: over(&tk.snapshot_mode, &gk.snapshot_mode),
            use_new_run: over(&tk.use_new_run, &gk.use_new_run),
            cleanup: over(&tk.cleanup, &gk.cleanup),
            custom_platform: over(&tk.custom_platform, &gk.custom_platform),
            no_push: over(&tk.no_push, &gk.no_push),
            ignore_paths,
            extra_flags: over(&tk.extra_flags, &gk.extra_flags),
        });
    }

    Ok(list)
}

/// First non-empty value, trimmed.
fn coalesce(values: &[Option<&str>]) -> String {
    values
        .iter()
        .flatten()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Tri-state override: the bake value wins whenever the key was present
/// in the document (explicit null clears), otherwise the global value.
fn over<T: Clone>(bake: &Option<Option<T>>, global: &Option<T>) -> Option<T> {
    match bake {
        Some(value) => value.clone(),
        None => global.clone(),
    }
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
