//! Mailflow: email sequencing and delivery engine.
//!
//! Loads configuration, builds the engine over the in-memory store, registers
//! the definition catalog, starts the scheduler workers and serves the HTTP
//! ingress until Ctrl-C.

use clap::Parser;
use mailflow_api::rest::AppState;
use mailflow_api::ApiServer;
use mailflow_core::config::AppConfig;
use mailflow_core::MemoryStore;
use mailflow_engine::{Catalog, MailEngine};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mailflow")]
#[command(about = "Email sequencing and delivery engine")]
#[command(version)]
struct Cli {
    /// Optional TOML config file layered under the environment
    #[arg(long, env = "MAILFLOW_CONFIG")]
    config: Option<String>,

    /// Templates, audiences, sequences and campaigns to register at startup
    #[arg(long, env = "MAILFLOW_CATALOG")]
    catalog: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "MAILFLOW__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "MAILFLOW__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Scheduler workers per node (overrides config)
    #[arg(long, env = "MAILFLOW__SCHEDULER__WORKERS")]
    workers: Option<usize>,

    /// Serve ingress only; jobs are left for other nodes
    #[arg(long, default_value_t = false)]
    no_workers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailflow=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Mailflow starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(workers) = cli.workers {
        config.scheduler.workers = workers;
    }

    info!(
        node_id = %config.node_id,
        workers = config.scheduler.workers,
        http_port = config.api.http_port,
        transport = ?config.delivery.transport,
        "Configuration loaded"
    );

    let engine = Arc::new(MailEngine::builder(config.clone(), Arc::new(MemoryStore::new())).build()?);
    if let Some(path) = cli.catalog.as_deref() {
        let summary = engine.load_catalog(Catalog::load(path)?)?;
        info!(
            path,
            templates = summary.templates,
            sequences = summary.sequences,
            campaigns = summary.campaigns,
            "Definition catalog registered"
        );
    } else {
        warn!("No catalog given; definitions must be registered over HTTP");
    }
    let state = AppState::new(engine.clone());
    let api_server = ApiServer::new(config.clone(), state.clone());

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let workers = if cli.no_workers {
        info!("Running in ingress-only mode (no scheduler workers)");
        None
    } else {
        let workers = engine.spawn_workers(config.scheduler.workers);
        info!(workers = workers.worker_count(), "Scheduler workers started");
        Some(workers)
    };
    state.ready.store(true, Ordering::Release);

    info!("Mailflow is ready to serve traffic");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    };
    api_server.start_http(shutdown).await?;

    state.ready.store(false, Ordering::Release);
    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    info!("Mailflow stopped");
    Ok(())
}
