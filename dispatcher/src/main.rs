use anyhow::{Context, Result};
use clap::Parser;
use nectar_common::{EthLedger, Ledger};
use nectar_dispatcher::{
    api::ApiServer,
    config::Args,
    listener::EventListener,
    reconciler::Reconciler,
    reliability::{retry_with_backoff, RetryConfig},
    Coordinator,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nectar_dispatcher=info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting Nectar dispatcher");
    info!("JobManager: {}", args.job_manager);
    info!("Reputation: {}", args.reputation);
    info!("RPC: {}", args.rpc);

    let ledger = Arc::new(EthLedger::new(
        &args.rpc,
        args.job_manager_address()?,
        args.reputation_address()?,
        args.ledger_timeout(),
    )?);

    // ledger must be reachable before we start serving
    let chain_id = retry_with_backoff(
        || {
            let ledger = ledger.clone();
            async move { Ok(ledger.chain_id().await?) }
        },
        &RetryConfig::default(),
    )
    .await
    .context("ledger unreachable")?;
    info!("Connected to chain {}", chain_id);

    let coordinator = Arc::new(Coordinator::new(args.coordinator_config()));

    // liveness sweep
    tokio::spawn(coordinator.clone().run_sweeper());

    // ledger events
    let ledger: Arc<dyn Ledger> = ledger;
    let reconciler = Reconciler::new(coordinator.clone(), ledger.clone());
    let listener = EventListener::new(ledger, reconciler, args.poll_interval(), args.start_block)
        .await
        .context("failed to initialize event listener")?;
    tokio::spawn(listener.run());

    let app = ApiServer::new(coordinator).routes();

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("API server listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
