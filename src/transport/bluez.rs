//! BlueZ adapter: discovery, GATT link and notifications via `bluer`

use crate::transport::traits::{BleAdapter, LinkLossNotifier, NotificationSink};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use bridge_shared::{gatt, link, AttributeId, DeviceFilter, DeviceHandle};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Configuration for BLE discovery
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How long to scan for devices
    pub scan_duration: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_millis(link::SCAN_DURATION_MS),
        }
    }
}

/// Background tasks bound to one link; aborted when dropped
///
/// Pumps hold a `NotificationSink`, so a detached pump would keep the
/// inbound bridge alive after the link is gone.
#[derive(Default)]
struct LinkTasks(Vec<JoinHandle<()>>);

impl LinkTasks {
    fn push(&mut self, task: JoinHandle<()>) {
        self.0.push(task);
    }

    fn abort_all(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LinkTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// The currently open (or opening) GATT link
struct ActiveLink {
    address: Address,
    device: Device,
    characteristics: HashMap<AttributeId, Characteristic>,
    /// Link watcher and notification pumps
    tasks: LinkTasks,
}

impl ActiveLink {
    fn characteristic(&self, channel: AttributeId) -> Result<&Characteristic> {
        self.characteristics
            .get(&channel)
            .ok_or_else(|| anyhow!("Characteristic {} not found on {}", channel, self.address))
    }

    /// Stop the link's tasks and drop the radio connection
    async fn close(mut self) {
        self.tasks.abort_all();
        if let Err(e) = self.device.disconnect().await {
            warn!("[BLE] Disconnect from {} failed: {}", self.address, e);
        }
    }
}

/// BLE adapter backed by the BlueZ daemon
pub struct BluerAdapter {
    config: ScanConfig,
    adapter: Adapter,
    link: Option<ActiveLink>,
}

impl BluerAdapter {
    /// Open the default Bluetooth adapter and power it on
    pub async fn new(config: ScanConfig) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("[BLE] Using adapter {}", adapter.name());

        Ok(Self {
            config,
            adapter,
            link: None,
        })
    }

    fn parse_address(device: &DeviceHandle) -> Result<Address> {
        device
            .address
            .parse::<Address>()
            .map_err(|_| anyhow!("Invalid device address: {}", device.address))
    }

    fn active_link(&self, device: &DeviceHandle) -> Result<&ActiveLink> {
        let address = Self::parse_address(device)?;
        match &self.link {
            Some(link) if link.address == address => Ok(link),
            _ => Err(anyhow!("No active link to {}", device)),
        }
    }

    fn active_link_mut(&mut self, device: &DeviceHandle) -> Result<&mut ActiveLink> {
        let address = Self::parse_address(device)?;
        match &mut self.link {
            Some(link) if link.address == address => Ok(link),
            _ => Err(anyhow!("No active link to {}", device)),
        }
    }

    /// Resolve the characteristics of the UART and DOF services
    async fn resolve_characteristics(
        device: &Device,
    ) -> Result<HashMap<AttributeId, Characteristic>> {
        let mut characteristics = HashMap::new();
        for service in device.services().await? {
            let service_id = service.uuid().await?;
            if !gatt::BRIDGED_SERVICES.contains(&service_id) {
                continue;
            }
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                characteristics.insert(uuid, characteristic);
            }
        }
        Ok(characteristics)
    }

    /// Watch device properties and fire the notifier once the link drops
    async fn watch_link(device: &Device, link_loss: LinkLossNotifier) -> Result<JoinHandle<()>> {
        let device = device.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let watcher = tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    debug!("[BLE] {} reported disconnect", device.address());
                    break;
                }
            }
            // Property stream also ends when the device object is removed
            link_loss.notify();
        });

        ready_rx
            .await
            .map_err(|_| anyhow!("Link watcher exited before start"))??;
        Ok(watcher)
    }
}

#[async_trait]
impl BleAdapter for BluerAdapter {
    async fn scan(&mut self, filter: &DeviceFilter) -> Result<Vec<DeviceHandle>> {
        let mut found: Vec<(DeviceHandle, Option<i16>)> = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        let discover = self.adapter.discover_devices().await?;
        tokio::pin!(discover);

        // Scan for the configured duration
        let adapter = &self.adapter;
        let scan_result = timeout(self.config.scan_duration, async {
            while let Some(evt) = discover.next().await {
                let AdapterEvent::DeviceAdded(addr) = evt else {
                    continue;
                };
                if !seen.insert(addr) {
                    continue;
                }

                let Ok(device) = adapter.device(addr) else {
                    continue;
                };
                if let Ok(Some(name)) = device.name().await {
                    if filter.matches(&name) {
                        debug!("[BLE] Found {} ({})", name, addr);
                        let rssi = device.rssi().await.ok().flatten();
                        found.push((DeviceHandle::new(addr.to_string(), name), rssi));
                    }
                }
            }
        })
        .await;

        // Timeout is expected, not an error
        if scan_result.is_err() {
            debug!("[BLE] Discovery scan completed");
        }

        // Strongest signal first
        found.sort_by(|a, b| {
            let rssi_a = a.1.unwrap_or(i16::MIN);
            let rssi_b = b.1.unwrap_or(i16::MIN);
            rssi_b.cmp(&rssi_a)
        });

        Ok(found.into_iter().map(|(handle, _)| handle).collect())
    }

    async fn connect(&mut self, device: &DeviceHandle, link_loss: LinkLossNotifier) -> Result<()> {
        if let Some(stale) = self.link.take() {
            stale.close().await;
        }

        let address = Self::parse_address(device)?;
        let bt_device = self.adapter.device(address)?;

        // Watcher goes in before connecting so no drop is missed
        let watcher = Self::watch_link(&bt_device, link_loss).await?;

        // Stored up front: if this future is dropped mid-connect, a later
        // disconnect still finds the link and closes it
        let mut tasks = LinkTasks::default();
        tasks.push(watcher);
        self.link = Some(ActiveLink {
            address,
            device: bt_device.clone(),
            characteristics: HashMap::new(),
            tasks,
        });

        let established = async {
            bt_device.connect().await?;
            Self::resolve_characteristics(&bt_device).await
        }
        .await;

        match established {
            Ok(characteristics) => {
                info!(
                    "[BLE] Connected to {} ({} characteristics)",
                    device,
                    characteristics.len()
                );
                if let Some(link) = self.link.as_mut() {
                    link.characteristics = characteristics;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(link) = self.link.take() {
                    link.close().await;
                }
                Err(e)
            }
        }
    }

    async fn subscribe_notifications(
        &mut self,
        device: &DeviceHandle,
        channel: AttributeId,
        sink: NotificationSink,
    ) -> Result<()> {
        let link = self.active_link_mut(device)?;
        let characteristic = link.characteristic(channel)?.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let pump = tokio::spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut notifications = Box::pin(notifications);
            while let Some(value) = notifications.next().await {
                sink.deliver(channel, value);
            }
            debug!("[BLE] Notification stream on {} ended", channel);
        });

        if let Err(e) = ready_rx
            .await
            .map_err(|_| anyhow!("Notification pump exited before start"))
            .and_then(|started| started.map_err(anyhow::Error::from))
        {
            pump.abort();
            return Err(e);
        }
        link.tasks.push(pump);

        info!("[BLE] Subscribed to notifications on {}", channel);
        Ok(())
    }

    async fn write_attribute(
        &mut self,
        device: &DeviceHandle,
        channel: AttributeId,
        data: Bytes,
        ack_required: bool,
    ) -> Result<()> {
        let link = self.active_link(device)?;
        let request = CharacteristicWriteRequest {
            op_type: if ack_required {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..Default::default()
        };
        link.characteristic(channel)?
            .write_ext(&data, &request)
            .await?;
        Ok(())
    }

    async fn is_connected(&self, device: &DeviceHandle) -> bool {
        match self.active_link(device) {
            Ok(link) => link.device.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disconnect(&mut self, device: &DeviceHandle) -> Result<()> {
        let address = Self::parse_address(device)?;
        match self.link.take() {
            Some(link) if link.address == address => link.close().await,
            other => {
                self.link = other;
                // Not tracked (or already closed): make sure BlueZ lets go too
                let bt_device = self.adapter.device(address)?;
                if bt_device.is_connected().await.unwrap_or(false) {
                    bt_device.disconnect().await?;
                }
            }
        }
        info!("[BLE] Released link to {}", device);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BlueZ"
    }
}
