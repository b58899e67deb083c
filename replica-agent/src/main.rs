//! Replica Agent - Main entry point
//!
//! Slave daemon: replicates configured indexes from a replica-master.

use anyhow::Result;
use clap::Parser;
use replica_agent::{
    api,
    config::Config,
    daemon::{scheduler::ReplicationScheduler, shutdown::ShutdownCoordinator},
    replication::{replicator::RoundState, ReplicaNode},
    transfer::HttpMasterClient,
    utils,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run one round on every index and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    api::health::init_start_time();

    tracing::info!(
        "Starting replica-agent v{} (node_id: {}, master: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.id,
        config.master.url
    );

    let client = Arc::new(HttpMasterClient::new(&config.master.url, config.master.compression)?);
    let node = ReplicaNode::from_config(&config, client);

    if args.once {
        let mut failed = 0;
        for (index, result) in node.replicate_all().await {
            match result {
                Ok(status) => {
                    if status.state == RoundState::Failed {
                        failed += 1;
                    }
                    tracing::info!(
                        index = %index,
                        state = ?status.state,
                        strategy = ?status.strategy,
                        downloaded = status.files_downloaded,
                        deleted = status.files_deleted,
                        "Round finished"
                    );
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(index = %index, error = %e, "Round could not start");
                }
            }
        }
        if failed > 0 {
            anyhow::bail!("{} replication round(s) failed", failed);
        }
        return Ok(());
    }

    // Cron schedules
    let scheduler = ReplicationScheduler::new(node.clone()).await?;
    scheduler.init_schedules(&config).await?;
    scheduler.start().await?;

    let port = args.port.unwrap_or(config.node.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let shutdown_coordinator = ShutdownCoordinator::new();
    let app = api::create_router(api::AppState::new(config.node.id.clone(), node.clone()));

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown_coordinator.token();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_coordinator.wait_for_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }

    shutdown_coordinator.shutdown(&node, Duration::from_secs(30)).await;

    // Wait for server to finish (with timeout)
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
