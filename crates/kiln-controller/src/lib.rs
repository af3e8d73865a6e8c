// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-controller: the build-controller daemon.
//!
//! Accepts bake manifests over HTTP, fans each one out into remote worker
//! containers (AWS Fargate or Kubernetes), streams worker logs back to the
//! client, collects per-arch image digests, and publishes a manifest list
//! for multi-arch builds.

pub mod env;
pub mod executor;
pub mod k8s_config;
pub mod orchestrator;
pub mod publish;
pub mod server;

pub use executor::{Executor, ExecutorError, TaskContext};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use publish::{ManifestPublisher, PlatformImage, PublishError, RegistryPublisher};
