// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote execution substrates.
//!
//! The [`Executor`] trait is the seam between the orchestrator and the
//! machinery that actually runs a worker container somewhere: dispatch
//! one task, block until it terminates remotely, report executor-level
//! anomalies. Worker-reported build failures are *not* executor errors —
//! they arrive through the result callback.

pub mod fargate;
pub mod kubernetes;
pub(crate) mod worker_env;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use kiln_core::manifest::EffectiveConfig;
use kiln_core::resources::ResourceError;
use kiln_core::state::BuildState;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from executor operations. Every variant is an executor-level
/// anomaly; a remote worker that ran and failed its build is reported via
/// the result callback instead.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("remote task lost: {0}")]
    Lost(String),

    #[error("timeout waiting for remote task: {0}")]
    Timeout(String),

    #[error("remote state unreadable: {0}")]
    Remote(String),

    #[error("agent exit={0}")]
    AgentExit(i32),

    #[error(transparent)]
    Resources(#[from] ResourceError),
}

/// Per-dispatch routing data shared by every supervisor of one build.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Object-storage bucket holding the uploaded build context.
    pub context_bucket: String,
    /// Object key of the build context archive.
    pub context_key: String,
    /// URL workers stream their log lines to.
    pub ingest_url: String,
}

/// Dispatches one build task to a remote substrate and supervises it to
/// termination.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_task(
        &self,
        state: Arc<BuildState>,
        task_id: &str,
        config: &EffectiveConfig,
        task: &TaskContext,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError>;
}
