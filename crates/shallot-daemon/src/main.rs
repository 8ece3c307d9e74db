//! shallot-daemon: runs a complete overlay on one host.
//!
//! Starts the registry, the onion routers and the user agents over QUIC,
//! then waits for Ctrl-C.

use anyhow::Context;
use shallot_daemon::config::DaemonConfig;
use shallot_daemon::events::EventBus;
use shallot_daemon::network::launch_network;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config (logging level comes from it)
    let config = DaemonConfig::load().context("loading configuration")?;

    // 2. Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shallot={}", config.logging.log_level).parse()?),
        )
        .init();

    info!(
        relays = config.launch.relays,
        users = config.launch.users,
        registry_port = config.network.registry_port,
        "Shallot daemon starting"
    );

    // 3. Create event bus and mirror the configured categories into the log
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let filter = config.logging.event_filter();
    let event_log = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if !filter.matches(&event) => {}
                Ok(event) => debug!(
                    event_type = %event.event_type,
                    payload = %event.payload,
                    "Event"
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // 4. Launch the network over QUIC
    let fabric = config.network.fabric()?;
    let network = launch_network(&fabric, config.network.layout(), &config.launch, events)
        .await
        .context("launching network")?;

    // 5. Run until Ctrl-C
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    network.shutdown().await;
    event_log.abort();

    info!("Daemon stopped");
    Ok(())
}
