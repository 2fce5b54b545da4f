//! Inbound bridge: peripheral notifications -> bus

use crate::bus::BusGateway;
use bridge_shared::{codec, AttributeId, InboundNotification};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct InboundBridge {
    bus: Arc<dyn BusGateway>,
    response_topic: String,
}

impl InboundBridge {
    pub fn new(bus: Arc<dyn BusGateway>, response_topic: impl Into<String>) -> Self {
        Self {
            bus,
            response_topic: response_topic.into(),
        }
    }

    /// Decode one notification and publish it on the response channel
    ///
    /// Undecodable payloads are logged and dropped.
    pub fn on_notify(&self, channel: AttributeId, data: &[u8]) {
        let message = match codec::decode_notification(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("[BRIDGE] Dropping notification from {}: {}", channel, e);
                return;
            }
        };

        info!("[BRIDGE] Received from BLE device: {}", message);
        if let Err(e) = self.bus.publish(&self.response_topic, message) {
            error!("[BRIDGE] Failed to publish on {}: {}", self.response_topic, e);
        }
    }

    /// Drain the adapter's notification queue until every sink is gone
    pub fn spawn(self, mut notifications: mpsc::UnboundedReceiver<InboundNotification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                self.on_notify(notification.channel, &notification.data);
            }
            debug!("[BRIDGE] Notification queue closed");
        })
    }
}
