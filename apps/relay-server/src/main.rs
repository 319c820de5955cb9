// [[MISSION-RELAY]]/apps/relay-server/src/main.rs
// Purpose: Entry point. Starts the relay's background tasks, then serves HTTP + WS.
// Architecture: Application Boot
// Dependencies: Axum, Tower, Tokio

use anyhow::Context;

use mission_relay::config::ServerConfig;
use mission_relay::diagnostics::CLOSE_GOING_AWAY;
use mission_relay::observability::init_tracing;
use mission_relay::runtime::RelayRuntime;
use mission_relay::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&["mission_relay=debug", "tower_http=info"]);

    tracing::info!("Initializing Mission Relay...");

    let config = ServerConfig::from_env();
    let addr = format!("0.0.0.0:{}", config.port);
    let runtime = RelayRuntime::new(config);
    runtime.spawn_background();

    let app = server::router(runtime.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Mission Relay listening on http://{}", addr);

    let shutdown_runtime = runtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            shutdown_runtime.shutdown();
            let closed = shutdown_runtime.registry.close_all(CLOSE_GOING_AWAY, "server shutdown");
            tracing::info!(closed, "Closed observer sessions");
        })
        .await
        .context("Server error")?;

    Ok(())
}
