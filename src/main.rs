mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kms_leader::gate::{ActivationFlag, LeadershipStatus};
use kms_leader::health::HealthServer;
use kms_leader::lease::{InMemoryLeaseBackend, LeaseBackend};
use kms_leader::{CallbackBuilder, ElectionController};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{BackendKind, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.election_config();
    info!(
        name = %config.name,
        namespace = %config.namespace,
        identity = %config.identity,
        lease_duration = ?config.lease_duration,
        renew_deadline = ?config.renew_deadline,
        retry_period = ?config.retry_period,
        "Leader election configuration"
    );

    let backend = build_backend(cli.backend).await?;

    let activation = ActivationFlag::new();
    let builder = CallbackBuilder::new(config.identity.clone());
    let callbacks = activation.gate_callbacks(&builder, builder.build_logging_callbacks(), cli.callback_timeout());

    let controller =
        ElectionController::new(config, backend, callbacks).context("invalid leader election configuration")?;
    let status = LeadershipStatus::new(controller.clone(), activation);

    let shutdown = CancellationToken::new();
    let health = HealthServer::bind(cli.health_addr, status)
        .await
        .with_context(|| format!("failed to bind health server on {}", cli.health_addr))?;
    let health_task = tokio::spawn(health.serve(shutdown.child_token()));

    controller.start(&shutdown)?;
    info!("kms-elector running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    shutdown.cancel();
    controller.stop().await;

    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server error"),
        Err(e) => error!(error = %e, "Health server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn build_backend(kind: BackendKind) -> anyhow::Result<Arc<dyn LeaseBackend>> {
    match kind {
        BackendKind::Memory => {
            info!("Using in-memory lease backend");
            Ok(Arc::new(InMemoryLeaseBackend::new()))
        }
        #[cfg(feature = "kubernetes")]
        BackendKind::Kubernetes => {
            info!("Using Kubernetes lease backend");
            let backend = kms_leader::lease::KubernetesLeaseBackend::try_default()
                .await
                .context("failed to create Kubernetes client")?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "kubernetes"))]
        BackendKind::Kubernetes => {
            anyhow::bail!("kms-elector was built without the `kubernetes` feature")
        }
    }
}
