use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatmesh_backend::{
    api::{AppState, Backends},
    config::Config,
    create_router,
    db::Database,
    fanout::FanoutQueue,
    presence::PresenceStore,
};
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ChatMesh Backend");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(node_id = %config.node_id, "Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let backends = Backends::from_config(&config, &db)?;
    tracing::info!(
        presence = backends.presence.backend_name(),
        queue = backends.queue.backend_name(),
        "Backends ready"
    );

    let shutdown = CancellationToken::new();
    let port = config.port;
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let (state, tasks) = AppState::start(config, db, backends, shutdown.clone());
    let state = state.with_metrics(metrics);

    // Build router
    let app = create_router(state.clone());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let drain_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            // websocket upgrades outlive the listener, close them first
            drain_state.drain().await;
        })
        .await?;

    shutdown.cancel();
    let stopped = tokio::time::timeout(grace, futures::future::join_all(tasks)).await;
    if stopped.is_err() {
        tracing::warn!("Background tasks did not stop within {:?}", grace);
    }

    // the liveness loop may have beaten once more after the drain
    if let Err(e) = state.presence.forget_node(state.node_id()).await {
        tracing::warn!("Failed to remove node from presence registry: {}", e);
    }

    tracing::info!("ChatMesh Backend stopped");
    Ok(())
}
