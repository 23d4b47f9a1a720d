//! Workflow controller daemon
//!
//! Runs the controller against the bundled in-memory cluster. Workflow
//! manifests (JSON) passed with `--submit` are created at startup.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_controller::{
    export_metrics, ControllerConfig, ControllerDeps, ControllerMetrics, InMemoryCluster,
    WorkflowController,
};
use workflow_engine::{InMemoryOffloadStore, InMemoryTaskBackend};
use workflow_types::Workflow;

/// Workflow controller CLI
#[derive(Parser)]
#[command(name = "workflow-controller")]
#[command(about = "Workflow controller - reconciles declarative workflows", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WORKFLOW_CONFIG")]
    config: Option<String>,

    /// Number of reconciliation workers
    #[arg(short, long, env = "WORKFLOW_WORKERS")]
    workers: Option<usize>,

    /// Log level (overrides `logging.level`)
    #[arg(long, env = "WORKFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging (overrides `logging.json`)
    #[arg(long, env = "WORKFLOW_LOG_JSON")]
    json: bool,

    /// Workflow manifests to submit at startup
    #[arg(long)]
    submit: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        ControllerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(workers) = cli.workers {
        config.dispatch.workers = workers;
    }

    // Initialize tracing
    let logging = config.effective_logging(cli.log_level.as_deref(), cli.json);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let registry = prometheus::Registry::new();
    let metrics =
        Arc::new(ControllerMetrics::new(&registry).context("failed to register metrics")?);

    let cluster = Arc::new(InMemoryCluster::new());
    let events = cluster.subscribe();
    for path in &cli.submit {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let wf: Workflow =
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
        cluster
            .create_workflow(&wf)
            .with_context(|| format!("submitting {path}"))?;
        tracing::info!(key = %wf.key(), "Workflow submitted");
    }

    let deps = ControllerDeps::in_memory(
        cluster,
        Arc::new(InMemoryTaskBackend::auto_completing()),
        Arc::new(InMemoryOffloadStore::new()),
    );
    let controller = Arc::new(WorkflowController::new(config, deps, metrics));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    controller.run(events, shutdown_rx).await?;

    let exported = export_metrics(&registry).context("failed to export metrics")?;
    tracing::debug!(metrics = %exported, "Final controller metrics");
    Ok(())
}
