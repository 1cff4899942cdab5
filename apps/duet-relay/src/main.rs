use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use duet_relay::config::{Cli, RelayConfig};
use duet_relay::identity::IdentityVerifier;
use duet_relay::registry::RoomRegistry;
use duet_relay::relay::SignalingRelay;
use duet_relay::{build_router, telemetry, AppState};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics = telemetry::init()?;

    let config = RelayConfig::try_from(Cli::parse())?;
    info!(
        listen_addr = %config.listen_addr,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "starting duet relay"
    );

    let registry = RoomRegistry::new();
    let relay = SignalingRelay::new(registry.clone());
    let state = Arc::new(
        AppState::new(relay.clone(), IdentityVerifier::new(&config.identity_secret))
            .with_metrics(metrics),
    );

    let sweeper = registry.spawn_sweeper(config.sweep_interval, config.stale_room_age);
    let heartbeat = relay.spawn_heartbeat_monitor(config.heartbeat_timeout);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("duet relay listening on {}", config.listen_addr);

    let drain = relay.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            info!("shutdown signal received; leaving all rooms");
            drain.shutdown().await;
        })
        .await
        .context("server shutdown with error")?;

    sweeper.abort();
    heartbeat.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}
