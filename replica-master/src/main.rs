mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::services::session_expiry::start_session_expiry;
use crate::state::AppState;
use replica_agent::replication::MasterRegistry;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting replica master on port {}", config.port);

    std::fs::create_dir_all(&config.indexes_dir)?;
    let registry = MasterRegistry::discover(&config.indexes_dir)?;
    tracing::info!(
        indexes = ?registry.indexes().collect::<Vec<_>>(),
        dir = %config.indexes_dir.display(),
        "Serving indexes"
    );

    let state = Arc::new(AppState::new(config.clone(), registry.clone()));

    // Session expiry
    let cancel = CancellationToken::new();
    let expiry = start_session_expiry(
        registry.clone(),
        config.session_ttl,
        config.session_sweep,
        cancel.clone(),
    );

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    let _ = expiry.await;

    state.registry.close();
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
