//! Outbound bridge: bus commands and stream frames -> peripheral

use crate::bus::{BusGateway, BusTopics};
use crate::connection::ConnectionHandle;
use crate::shutdown::ShutdownSignal;
use bridge_shared::{codec, OutboundMessage};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Forwards bus messages to the connection manager, dropping them while the
/// link is down
#[derive(Debug, Clone)]
pub struct OutboundBridge {
    connection: ConnectionHandle,
}

impl OutboundBridge {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self { connection }
    }

    /// Handle a plain-text command
    pub async fn on_command(&self, text: String) {
        info!("[BRIDGE] Sending to BLE device: CMD | {}", text);
        self.forward(OutboundMessage::Command(text)).await;
    }

    /// Handle a hex-encoded stream frame
    pub async fn on_stream_frame(&self, hex_text: &str) {
        debug!("[BRIDGE] Sending to BLE device: DOF | {}", hex_text);
        let frame = match codec::decode_stream_frame(hex_text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[BRIDGE] Dropping stream frame {:?}: {}", hex_text, e);
                return;
            }
        };
        self.forward(OutboundMessage::StreamFrame(frame)).await;
    }

    async fn forward(&self, message: OutboundMessage) {
        let state = self.connection.state();
        if !state.is_connected() {
            match message {
                OutboundMessage::Command(_) => {
                    warn!("[BRIDGE] Device {}, dropping CMD message", state)
                }
                // High rate; keep it out of the default log level
                OutboundMessage::StreamFrame(_) => {
                    debug!("[BRIDGE] Device {}, dropping DOF frame", state)
                }
            }
            return;
        }

        if let Err(e) = self.connection.send(message) {
            warn!("[BRIDGE] {:#}", e);
        }
    }

    /// Subscribe to the command and stream channels; one task per channel
    /// keeps per-channel ordering
    pub fn spawn(
        self,
        bus: &dyn BusGateway,
        topics: &BusTopics,
        shutdown: ShutdownSignal,
    ) -> Vec<JoinHandle<()>> {
        let commands = bus.subscribe(&topics.command);
        let frames = bus.subscribe(&topics.stream);

        let bridge = self.clone();
        let command_task = tokio::spawn(pump(
            topics.command.clone(),
            commands,
            shutdown.clone(),
            move |text| {
                let bridge = bridge.clone();
                async move { bridge.on_command(text).await }
            },
        ));

        let bridge = self;
        let stream_task = tokio::spawn(pump(
            topics.stream.clone(),
            frames,
            shutdown,
            move |hex_text| {
                let bridge = bridge.clone();
                async move { bridge.on_stream_frame(&hex_text).await }
            },
        ));

        vec![command_task, stream_task]
    }
}

/// Feed every message of one bus channel to `handle`, in order
async fn pump<F, Fut>(
    channel: String,
    mut rx: broadcast::Receiver<String>,
    mut shutdown: ShutdownSignal,
    handle: F,
) where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            received = rx.recv() => match received {
                Ok(payload) => handle(payload).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[BRIDGE] {} lagging, skipped {} message(s)", channel, skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("[BRIDGE] Stopped listening on {}", channel);
}
