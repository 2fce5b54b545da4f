//! Adapter trait abstraction over the platform BLE stack

use anyhow::Result;
use async_trait::async_trait;
use bridge_shared::{AttributeId, DeviceFilter, DeviceHandle, InboundNotification};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Loss of a specific link, as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLost {
    pub link_id: u64,
}

/// Installed by the connection manager before every connect
///
/// The adapter fires it when the link drops. It may be fired from any task
/// or thread; only the first call per link is delivered.
#[derive(Debug, Clone)]
pub struct LinkLossNotifier {
    link_id: u64,
    fired: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<LinkLost>,
}

impl LinkLossNotifier {
    pub fn new(link_id: u64, tx: mpsc::UnboundedSender<LinkLost>) -> Self {
        Self {
            link_id,
            fired: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Report that the link is gone
    pub fn notify(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(LinkLost {
            link_id: self.link_id,
        });
    }
}

/// Where the adapter pushes notification payloads
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<InboundNotification>,
}

impl NotificationSink {
    pub fn new(tx: mpsc::UnboundedSender<InboundNotification>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Hand a payload to the inbound bridge
    pub fn deliver(&self, channel: AttributeId, data: Vec<u8>) {
        let _ = self.tx.send(InboundNotification::new(channel, data));
    }
}

/// Capability interface over the wireless stack
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Discover peripherals whose advertised name matches `filter`
    async fn scan(&mut self, filter: &DeviceFilter) -> Result<Vec<DeviceHandle>>;

    /// Establish a link; `link_loss` must be fired when it drops
    async fn connect(&mut self, device: &DeviceHandle, link_loss: LinkLossNotifier) -> Result<()>;

    /// Ask the peripheral to push payloads on `channel` into `sink`
    async fn subscribe_notifications(
        &mut self,
        device: &DeviceHandle,
        channel: AttributeId,
        sink: NotificationSink,
    ) -> Result<()>;

    /// Write to a characteristic, with response when `ack_required`
    async fn write_attribute(
        &mut self,
        device: &DeviceHandle,
        channel: AttributeId,
        data: Bytes,
        ack_required: bool,
    ) -> Result<()>;

    async fn is_connected(&self, device: &DeviceHandle) -> bool;

    /// Release the link and everything attached to it
    async fn disconnect(&mut self, device: &DeviceHandle) -> Result<()>;

    /// Human-readable name for this adapter
    fn name(&self) -> &'static str;
}
