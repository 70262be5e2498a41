use anyhow::Result;
use clap::Parser;
use nectar_worker::{config::Args, DispatcherClient, ExecutionEngine, WorkerAgent};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nectar_worker=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.agent_config();

    info!("Starting Nectar worker {}", config.address);
    info!("Dispatcher: {}", args.dispatcher);
    info!("Capabilities: {}", config.capabilities.join(", "));
    info!("Max concurrent jobs: {}", config.max_concurrent_jobs);

    let client = DispatcherClient::new(&args.dispatcher, args.request_timeout())?;
    let engine = ExecutionEngine::new(args.engine_config());
    let agent = Arc::new(WorkerAgent::new(config, client, engine));

    agent.start().await?;

    agent
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    Ok(())
}
