mod bridge;
mod bus;
mod config;
mod connection;
mod shutdown;
mod transport;

use bridge::{InboundBridge, OutboundBridge};
use bus::{BusGateway, LocalBus, TcpBusGateway};
use config::BridgeConfig;
use connection::ConnectionManager;
use shutdown::ShutdownSignal;
use std::sync::Arc;
use transport::{BluerAdapter, NotificationSink};

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = BridgeConfig::from_env();

    info!("[MAIN] BLE serial bridge starting");
    info!("[MAIN]   Device filter: '{}'", config.connection.filter.0);
    info!(
        "[MAIN]   Channels: {} / {} -> {}",
        config.bus.topics.command, config.bus.topics.stream, config.bus.topics.response
    );

    let shutdown = ShutdownSignal::new();

    // Bus: in-process hub plus TCP front end for other processes
    let bus = Arc::new(LocalBus::new(config.bus.capacity));
    let gateway = TcpBusGateway::bind(
        &config.bus.listen_addr,
        bus.clone(),
        config.bus.topics.clone(),
    )
    .await?;
    info!("[MAIN]   Bus gateway: {}", gateway.local_addr()?);
    let gateway_task = tokio::spawn(gateway.serve(shutdown.clone()));

    // Peripheral link
    let adapter = BluerAdapter::new(config.scan.clone()).await?;
    let (sink, notifications) = NotificationSink::channel();
    let manager = ConnectionManager::start(config.connection.clone(), adapter, sink, shutdown.clone());

    // Bridges
    let inbound_task =
        InboundBridge::new(bus.clone(), config.bus.topics.response.clone()).spawn(notifications);
    let outbound_tasks = OutboundBridge::new(manager.handle()).spawn(
        bus.as_ref() as &dyn BusGateway,
        &config.bus.topics,
        shutdown.clone(),
    );

    // Report link state changes
    let mut states = manager.handle().subscribe_state();
    let state_task = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!("[MAIN] Link state: {}", state);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[MAIN] Failed to listen for Ctrl-C: {}", e);
    }
    info!("[MAIN] Shutting down");

    manager.shutdown().await;
    for task in outbound_tasks.into_iter().chain([gateway_task, inbound_task, state_task]) {
        if let Err(e) = task.await {
            error!("[MAIN] Task failed during shutdown: {}", e);
        }
    }

    info!("[MAIN] Bridge stopped");
    Ok(())
}
