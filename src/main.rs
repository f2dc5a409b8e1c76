//! Presence hub - Entry Point
//!
//! Parses configuration, starts the Hub actor and accepts connections.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use presence_hub::{serve, Config, EmptyHistory, Hub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=presence_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("presence_hub=info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let sessions = config.static_sessions();
    if sessions.is_empty() {
        warn!("No sessions configured, every upgrade will be rejected");
    }

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind).await?;
    info!("Presence hub listening on {}", config.bind);

    // No history collaborator is wired into the standalone binary
    let (hub, handle) = Hub::new(Arc::new(EmptyHistory), config.hub_settings());
    tokio::spawn(hub.run());

    info!("Hub actor started");

    serve(
        listener,
        handle,
        Arc::new(sessions),
        config.connection_settings(),
    )
    .await;

    Ok(())
}
