use std::sync::Arc;

use mcsm_core::config::GlobalConfig;
use mcsm_core::supervisor::{ServerEvent, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("mcsm-core daemon starting");

    let config = GlobalConfig::load();
    let supervisor = Arc::new(Supervisor::new(config));

    let servers = supervisor.list_servers();
    tracing::info!("Detected {} server(s)", servers.len());
    for server in &servers {
        tracing::info!("  - {} ({}, {})", server.name, server.kind, server.version);
    }

    // Log termination notices from the supervisor's event stream.
    let mut events = supervisor.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let ServerEvent::Stopped { id } = event;
            tracing::info!("Server '{}' stopped", id);
        }
    });

    // Graceful shutdown: stop every running server before exiting.
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, stopping running servers...");
    supervisor.shutdown_all().await;
    tracing::info!("Cleanup complete, exiting");
    Ok(())
}
