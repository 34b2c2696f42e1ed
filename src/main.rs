//! peili entry point

use clap::Parser;
use peili::config::Config;
use peili::error::Result;
use peili::metrics::Metrics;
use peili::pipeline::{EndpointGroup, Pipeline};
use peili::queue::QueueConfig;
use peili::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Durable HTTP fan-out proxy
#[derive(Parser)]
#[command(name = "peili", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Root directory for the durable queues
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
}

fn main() {
    init_tracing();

    if let Err(e) = run() {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    Metrics::init()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cli, config))
}

async fn serve(cli: Cli, config: Config) -> Result<()> {
    if !cli.data_dir.is_dir() {
        info!(path = %cli.data_dir.display(), "creating data directory");
        std::fs::create_dir_all(&cli.data_dir)?;
    }

    let max_msg_size = config.max_message_size().min(u32::MAX as u64) as u32;
    info!(
        timeout = ?config.timeout(),
        max_msg_size,
        concurrency = config.concurrency(),
        "config options"
    );

    // Pipelines come up before the listener so that backlog from a
    // previous run starts replaying ahead of any new traffic.
    let mut pipelines = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        let group = EndpointGroup {
            name: endpoint.name.clone(),
            hosts: endpoint.hosts.clone(),
            timeout: config.timeout(),
            concurrency: config.concurrency(),
        };
        let mut queue_config = QueueConfig::new(
            &endpoint.name,
            cli.data_dir.join(&endpoint.name),
            max_msg_size,
        );
        queue_config.inbox_capacity = config.inbox_capacity();

        pipelines.push(Pipeline::start(
            group,
            queue_config,
            config.http.danger_accept_invalid_certs,
        )?);
    }

    let state = Arc::new(AppState {
        inboxes: pipelines.iter().map(|p| p.inbox()).collect(),
        max_body_bytes: max_msg_size as usize,
    });

    server::serve(config.listen(), server::router(state)).await?;

    // The listener is gone; drain each pipeline and let the queues sync.
    for pipeline in pipelines {
        pipeline.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
