//! Workload Policy Operator
//!
//! Main entry point for the operator. Parses the feature switches, loads and
//! validates the configuration, then runs the Deployment controller and the
//! metrics server until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use workload_policy_operator::{
    adapters::cluster::KubeCluster,
    config::{self, Features, Settings},
    controllers::{deployment_controller, Context},
    metrics,
};

/// Workload Policy Operator CLI
#[derive(Parser, Debug)]
#[command(name = "workload-policy-operator")]
#[command(about = "Enforces container resources and mirrors Deployments to virtual nodes", long_about = None)]
#[command(version)]
struct Cli {
    /// Enforce the configured resources on the designated container
    #[arg(long)]
    set_resource: bool,

    /// Mirror configured Deployments into zero-scaled shadows
    #[arg(long)]
    eklet_deployment: bool,

    /// Configuration file path
    #[arg(
        short,
        long,
        env = "WORKLOAD_POLICY_CONFIG",
        default_value = "./config/config.yaml"
    )]
    config: PathBuf,

    /// Metrics and health port
    #[arg(long, env = "WORKLOAD_POLICY_METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing();

    let features = Features {
        enforce_resources: cli.set_resource,
        mirror_deployments: cli.eklet_deployment,
    };
    if !features.any() {
        warn!("Neither --set-resource nor --eklet-deployment given, nothing to do");
        return Ok(());
    }

    info!(config = %cli.config.display(), "Starting Workload Policy Operator");

    let settings = Settings::from_config(config::load(&cli.config)?, features)?;
    info!(
        namespaces = ?settings.namespaces,
        mirror_targets = settings.mirror.target_count(),
        update_permits = settings.update_permits,
        "Configuration loaded"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Create shared context
    let shutdown = CancellationToken::new();
    let context = Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        settings,
        shutdown.clone(),
    );

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(cli.metrics_port));
    info!("Metrics server starting on port {}", cli.metrics_port);

    // Run the Deployment controller
    let mut controller_handle = tokio::spawn(deployment_controller::run(client, context));

    // Handle graceful shutdown
    tokio::select! {
        _ = &mut controller_handle => {
            error!("Deployment controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    shutdown.cancel();
    if !controller_handle.is_finished() {
        if let Err(e) = controller_handle.await {
            error!("Deployment controller task failed: {}", e);
        }
    }

    info!("Workload Policy Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,workload_policy_operator=debug,kube=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
