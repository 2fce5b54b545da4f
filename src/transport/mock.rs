//! Scripted adapter for exercising the connection manager without a radio

use crate::transport::traits::{BleAdapter, LinkLossNotifier, NotificationSink};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bridge_shared::{AttributeId, DeviceFilter, DeviceHandle};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// A write the adapter was asked to perform
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub channel: AttributeId,
    pub data: Bytes,
    pub ack_required: bool,
}

/// Outcome of one scripted scan
#[derive(Debug, Clone)]
pub enum ScanScript {
    Devices(Vec<DeviceHandle>),
    Fault(String),
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Consumed front to back; once empty every scan returns `default_devices`
    pub scans: VecDeque<ScanScript>,
    pub default_devices: Vec<DeviceHandle>,
    /// Number of upcoming connect calls that fail
    pub connect_failures: usize,
    /// Number of upcoming subscribe calls that fail
    pub subscribe_failures: usize,
    /// Subscribe never completes
    pub subscribe_hangs: bool,
    pub fail_writes: bool,

    pub scan_count: usize,
    pub connect_attempts: Vec<Instant>,
    pub disconnect_count: usize,
    pub is_connected_calls: usize,
    pub subscriptions: Vec<AttributeId>,
    pub writes: Vec<RecordedWrite>,

    pub connected: Option<DeviceHandle>,
    pub link_loss: Option<LinkLossNotifier>,
    /// Every notifier ever installed, oldest first
    pub notifiers: Vec<LinkLossNotifier>,
    pub sink: Option<NotificationSink>,
}

/// Cloneable handle: the manager owns one clone, the test keeps another
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Adapter that always finds a single matching device
    pub fn with_device(name: &str) -> Self {
        let adapter = Self::default();
        adapter.state().default_devices = vec![DeviceHandle::new("AA:BB:CC:DD:EE:01", name)];
        adapter
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self) {
        let notifier = {
            let mut state = self.state();
            state.connected = None;
            state.link_loss.clone()
        };
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    /// Simulate the peripheral pushing a notification
    pub fn push_notification(&self, channel: AttributeId, data: &[u8]) {
        if let Some(sink) = self.state().sink.clone() {
            sink.deliver(channel, data.to_vec());
        }
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_attempts.len()
    }

    pub fn scan_count(&self) -> usize {
        self.state().scan_count
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn scan(&mut self, filter: &DeviceFilter) -> Result<Vec<DeviceHandle>> {
        let mut state = self.state();
        state.scan_count += 1;
        let script = match state.scans.pop_front() {
            Some(script) => script,
            None => ScanScript::Devices(state.default_devices.clone()),
        };

        match script {
            ScanScript::Devices(devices) => Ok(devices
                .into_iter()
                .filter(|device| filter.matches(&device.name))
                .collect()),
            ScanScript::Fault(reason) => Err(anyhow!(reason)),
        }
    }

    async fn connect(&mut self, device: &DeviceHandle, link_loss: LinkLossNotifier) -> Result<()> {
        let mut state = self.state();
        state.connect_attempts.push(Instant::now());
        state.notifiers.push(link_loss.clone());
        state.link_loss = Some(link_loss);

        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(anyhow!("connect to {} refused", device));
        }
        state.connected = Some(device.clone());
        Ok(())
    }

    async fn subscribe_notifications(
        &mut self,
        device: &DeviceHandle,
        channel: AttributeId,
        sink: NotificationSink,
    ) -> Result<()> {
        let hangs = self.state().subscribe_hangs;
        if hangs {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(anyhow!("subscribe on {} rejected by {}", channel, device));
        }
        state.subscriptions.push(channel);
        state.sink = Some(sink);
        Ok(())
    }

    async fn write_attribute(
        &mut self,
        device: &DeviceHandle,
        channel: AttributeId,
        data: Bytes,
        ack_required: bool,
    ) -> Result<()> {
        let mut state = self.state();
        state.writes.push(RecordedWrite {
            channel,
            data,
            ack_required,
        });
        if state.fail_writes {
            return Err(anyhow!("write to {} failed", device));
        }
        Ok(())
    }

    async fn is_connected(&self, device: &DeviceHandle) -> bool {
        let mut state = self.state();
        state.is_connected_calls += 1;
        state.connected.as_ref() == Some(device)
    }

    async fn disconnect(&mut self, _device: &DeviceHandle) -> Result<()> {
        let mut state = self.state();
        state.disconnect_count += 1;
        state.connected = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}
