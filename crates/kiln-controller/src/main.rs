// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! kilnd — the build-controller daemon.

use anyhow::Context as _;
use aws_config::BehaviorVersion;
use aws_config::Region;
use kiln_controller::executor::fargate::{FargateConfig, FargateExecutor};
use kiln_controller::executor::kubernetes::KubernetesExecutor;
use kiln_controller::executor::Executor;
use kiln_controller::server::{self, AppState};
use kiln_controller::{env, k8s_config, Orchestrator, OrchestratorConfig, RegistryPublisher};
use kiln_core::store::StateStore;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = match env::server_log_level() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let region = env::aws_region();
    tracing::info!(%region, cluster = %env::ecs_cluster(), "starting build controller");

    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.clone()))
        .load()
        .await;
    let ecs_client = aws_sdk_ecs::Client::new(&aws_config);

    if env::cleanup_task_definitions() {
        match FargateExecutor::cleanup_task_definitions(&ecs_client, &env::agent_task_family())
            .await
        {
            Ok(count) => tracing::info!(count, "deregistered stale task definitions"),
            Err(err) => tracing::warn!(%err, "task definition cleanup failed"),
        }
    }

    let fargate: Arc<dyn Executor> =
        Arc::new(FargateExecutor::new(ecs_client, FargateConfig::from_env()));

    let kubernetes: Option<Arc<dyn Executor>> = match kube::Client::try_default().await {
        Ok(client) => {
            let server_config = match env::k8s_config_path() {
                Some(path) => {
                    let config = k8s_config::load(Path::new(&path))
                        .with_context(|| format!("loading k8s config from {path}"))?;
                    tracing::info!(%path, "loaded k8s server config");
                    Some(config)
                }
                None => {
                    tracing::info!("K8S_CONFIG_PATH not set, using default k8s settings");
                    None
                }
            };
            Some(Arc::new(KubernetesExecutor::new(
                client,
                env::k8s_namespace(),
                env::agent_image(),
                env::controller_url(),
                server_config,
            )) as Arc<dyn Executor>)
        }
        Err(err) => {
            tracing::info!(%err, "kubernetes client unavailable, k8s dispatch disabled");
            None
        }
    };

    let store = Arc::new(StateStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        fargate,
        kubernetes,
        Arc::new(RegistryPublisher::new()),
        env::build_defaults(),
        OrchestratorConfig::from_env(),
    ));

    let ready = Arc::new(AtomicBool::new(false));
    let app = server::router(AppState {
        orchestrator,
        store,
        context_bucket: env::context_bucket(),
        auth_token: env::auth_token(),
        ready: ready.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], env::server_port()));
    let listener =
        tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    ready.store(true, Ordering::SeqCst);
    tracing::info!(%addr, "server is ready to accept requests");

    let drain = shutdown.clone();
    let mut serve = pin!(axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            drain.cancelled().await;
        })
        .into_future());

    tokio::select! {
        result = &mut serve => result.context("server error")?,
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => {
            tracing::warn!("graceful shutdown timed out, exiting");
        }
    }

    tracing::info!("server stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::error!(%err, "installing SIGTERM handler failed");
                    let _ = ctrl_c.await;
                    shutdown.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("received shutdown signal, draining");
    shutdown.cancel();
}
