//! Connection manager with automatic rediscovery and reconnection

use crate::shutdown::ShutdownSignal;
use crate::transport::{BleAdapter, LinkLost, LinkLossNotifier, NotificationSink};
use anyhow::{anyhow, Result};
use bridge_shared::{
    codec, gatt, link,
    state_machine::{LinkEvent, LinkStateMachine},
    AttributeId, ConnectionState, DeviceFilter, DeviceHandle, OutboundMessage,
};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Delay policy between failed connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// Delay doubles on each consecutive failure, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `failures`-th consecutive failure (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let shift = failures.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_millis(link::RETRY_DELAY_MS))
    }
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Advertised-name substring of the peripheral
    pub filter: DeviceFilter,
    /// Delay policy between failed attempts
    pub backoff: Backoff,
    /// Upper bound for connect + subscribe
    pub connect_timeout: Duration,
    /// Upper bound for a single attribute write
    pub write_timeout: Duration,
    /// Characteristic receiving text commands
    pub command_channel: AttributeId,
    /// Characteristic the peripheral notifies on
    pub notify_channel: AttributeId,
    /// Characteristic receiving stream frames
    pub stream_channel: AttributeId,
    /// Outbound queue depth
    pub queue_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::default(),
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
            command_channel: gatt::UART_RX,
            notify_channel: gatt::UART_TX,
            stream_channel: gatt::DOF_STREAM,
            queue_depth: 100,
        }
    }
}

/// Narrow, cloneable view of the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    state_rx: watch::Receiver<ConnectionState>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    shutdown: ShutdownSignal,
}

impl ConnectionHandle {
    /// Current link state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Queue a message for transmission to the peripheral
    ///
    /// Never waits: a full queue drops the message, so nothing is held back
    /// across a link loss and written to the next link.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.outbound_tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(message) => {
                anyhow!("outbound queue full, {} message dropped", message.kind())
            }
            TrySendError::Closed(_) => anyhow!("Connection manager closed"),
        })
    }

    /// Stop the connection manager
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Handle not backed by a running manager
    #[cfg(test)]
    pub(crate) fn detached(
        state: ConnectionState,
    ) -> (
        Self,
        mpsc::Receiver<OutboundMessage>,
        watch::Sender<ConnectionState>,
    ) {
        let (state_tx, state_rx) = watch::channel(state);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let handle = Self {
            state_rx,
            outbound_tx,
            shutdown: ShutdownSignal::new(),
        };
        (handle, outbound_rx, state_tx)
    }
}

/// Owns the peripheral link; everything else talks to it through a handle
pub struct ConnectionManager {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn start<A: BleAdapter>(
        config: ConnectionConfig,
        adapter: A,
        notifications: NotificationSink,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_depth);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (link_lost_tx, link_lost_rx) = mpsc::unbounded_channel();

        info!(
            "[CONN] Starting with {} adapter, filter '{}'",
            adapter.name(),
            config.filter.0
        );

        let worker = LinkWorker {
            config,
            adapter,
            fsm: LinkStateMachine::new(),
            state_tx,
            current: None,
            pending: None,
            next_link_id: 0,
            failures: 0,
            outbound_rx,
            link_lost_tx,
            link_lost_rx,
            notifications,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            handle: ConnectionHandle {
                state_rx,
                outbound_tx,
                shutdown,
            },
            task,
        }
    }

    /// Get a cloneable handle for the bridges
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Stop the loop, release the link and wait for the task to finish
    pub async fn shutdown(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            error!("[CONN] Connection task failed: {}", e);
        }
    }
}

/// Outcome of one scan + connect attempt
enum Attempt {
    Connected,
    NoDevice,
    Failed(anyhow::Error),
}

/// State owned by the manager task
struct LinkWorker<A: BleAdapter> {
    config: ConnectionConfig,
    adapter: A,
    fsm: LinkStateMachine,
    state_tx: watch::Sender<ConnectionState>,
    /// At most one current device
    current: Option<DeviceHandle>,
    /// Device whose connect or subscribe is still in flight
    pending: Option<DeviceHandle>,
    next_link_id: u64,
    /// Consecutive failed attempts
    failures: u32,
    outbound_rx: mpsc::Receiver<OutboundMessage>,
    link_lost_tx: mpsc::UnboundedSender<LinkLost>,
    link_lost_rx: mpsc::UnboundedReceiver<LinkLost>,
    notifications: NotificationSink,
    shutdown: ShutdownSignal,
}

impl<A: BleAdapter> LinkWorker<A> {
    /// Main connection loop; runs until shutdown
    async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        self.transition(LinkEvent::Started);

        while !shutdown.is_triggered() {
            match self.fsm.state() {
                ConnectionState::Scanning => {
                    let attempt = tokio::select! {
                        _ = shutdown.triggered() => break,
                        attempt = self.try_connect() => attempt,
                    };
                    if !self.after_attempt(attempt, &mut shutdown).await {
                        break;
                    }
                }
                ConnectionState::Connected => {
                    if !self.serve_link(&mut shutdown).await {
                        break;
                    }
                }
                ConnectionState::Disconnected => {
                    info!("[CONN] Starting reconnection");
                    self.transition(LinkEvent::ReconnectStarted);
                }
                // Only held inside try_connect; recover along a legal edge
                ConnectionState::Idle => {
                    self.transition(LinkEvent::Started);
                }
                ConnectionState::Connecting => {
                    self.transition(LinkEvent::LinkFailed);
                }
            }
        }

        self.release().await;
    }

    /// Apply an event to the state machine and publish the result
    fn transition(&mut self, event: LinkEvent) -> bool {
        let from = self.fsm.state();
        match self.fsm.process_event(event) {
            Ok(to) => {
                if from != to {
                    debug!("[CONN] {} -> {}", from, to);
                }
                self.state_tx.send_replace(to);
                true
            }
            Err(e) => {
                debug!("[CONN] {}", e);
                false
            }
        }
    }

    /// Scan once and, if a device matches, connect and subscribe
    ///
    /// `Err` is reserved for faults raised by the adapter during the scan.
    async fn try_connect(&mut self) -> Result<Attempt> {
        debug!("[CONN] Scanning for '{}'", self.config.filter.0);
        let devices = match self.adapter.scan(&self.config.filter).await {
            Ok(devices) => devices,
            Err(e) => {
                self.transition(LinkEvent::NoDeviceFound);
                return Err(e.context("scan failed"));
            }
        };

        let Some(mut device) = devices.into_iter().next() else {
            self.transition(LinkEvent::NoDeviceFound);
            return Ok(Attempt::NoDevice);
        };

        self.next_link_id += 1;
        device.link_id = self.next_link_id;
        self.transition(LinkEvent::DeviceFound);
        info!("[CONN] Connecting to {}", device);

        let link_loss = LinkLossNotifier::new(device.link_id, self.link_lost_tx.clone());
        // Released on shutdown even if this future is dropped mid-connect
        self.pending = Some(device.clone());
        let connect_timeout = self.config.connect_timeout;
        let established = match timeout(connect_timeout, self.establish(&device, link_loss)).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {:?}", connect_timeout)),
        };

        self.pending = None;
        match established {
            Ok(()) => {
                self.discard_queued();
                info!("[CONN] Connected to {}", device);
                self.current = Some(device);
                self.transition(LinkEvent::LinkEstablished);
                Ok(Attempt::Connected)
            }
            Err(e) => {
                // Don't leak a half-open link
                if let Err(cleanup) = self.adapter.disconnect(&device).await {
                    debug!("[CONN] Cleanup after failed connect: {}", cleanup);
                }
                self.transition(LinkEvent::LinkFailed);
                Ok(Attempt::Failed(e.context(format!("link to {} failed", device))))
            }
        }
    }

    async fn establish(&mut self, device: &DeviceHandle, link_loss: LinkLossNotifier) -> Result<()> {
        self.adapter.connect(device, link_loss).await?;
        self.adapter
            .subscribe_notifications(device, self.config.notify_channel, self.notifications.clone())
            .await?;
        Ok(())
    }

    /// Log the attempt and wait out the backoff after a failure
    ///
    /// Returns false if shutdown fired while waiting.
    async fn after_attempt(&mut self, attempt: Result<Attempt>, shutdown: &mut ShutdownSignal) -> bool {
        match attempt {
            Ok(Attempt::Connected) => {
                self.failures = 0;
                return true;
            }
            Ok(Attempt::NoDevice) => {
                info!("[CONN] No device matching '{}' found", self.config.filter.0);
            }
            Ok(Attempt::Failed(e)) => {
                warn!("[CONN] Failed to connect: {:#}", e);
            }
            Err(e) => {
                error!("[CONN] Error during reconnection: {:#}", e);
            }
        }

        self.failures = self.failures.saturating_add(1);
        let delay = self.config.backoff.delay(self.failures);
        info!(
            "[CONN] Retrying in {:?} (consecutive failures: {})",
            delay, self.failures
        );

        tokio::select! {
            _ = shutdown.triggered() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Serve writes until the link drops; false on shutdown
    async fn serve_link(&mut self, shutdown: &mut ShutdownSignal) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => return false,
                Some(lost) = self.link_lost_rx.recv() => {
                    let current_id = self.current.as_ref().map(|device| device.link_id);
                    if current_id == Some(lost.link_id) {
                        self.on_link_lost().await;
                        return true;
                    }
                    debug!("[CONN] Ignoring link loss for stale link {}", lost.link_id);
                }
                Some(message) = self.outbound_rx.recv() => {
                    self.write(message).await;
                }
            }
        }
    }

    async fn on_link_lost(&mut self) {
        self.transition(LinkEvent::LinkLost);
        if let Some(device) = self.current.take() {
            warn!("[CONN] {} disconnected, attempting to reconnect...", device);
            if let Err(e) = self.adapter.disconnect(&device).await {
                debug!("[CONN] Releasing lost link: {}", e);
            }
        }
    }

    /// Write one message to the current link
    ///
    /// Failures are logged; link state is corrected by the link-loss signal.
    async fn write(&mut self, message: OutboundMessage) {
        let Some(device) = self.current.as_ref() else {
            debug!("[CONN] No current device, dropping {} message", message.kind());
            return;
        };
        let ack_required = message.ack_required();
        // Stream frames rely on the link-loss signal; polling the radio per
        // frame would cap the stream rate
        let link_down = !self.fsm.state().is_connected()
            || (ack_required && !self.adapter.is_connected(device).await);
        if link_down {
            warn!("[CONN] Link to {} is down, dropping {} message", device, message.kind());
            return;
        }

        let (channel, payload) = match message {
            OutboundMessage::Command(ref text) => {
                (self.config.command_channel, codec::encode_command(text))
            }
            OutboundMessage::StreamFrame(ref frame) => (self.config.stream_channel, frame.clone()),
        };
        let len = payload.len();

        let write = self
            .adapter
            .write_attribute(device, channel, payload, ack_required);
        match timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => {
                debug!("[CONN] Wrote {} bytes to {}", len, channel);
            }
            Ok(Err(e)) => {
                error!("[CONN] Failed to write {} to {}: {:#}", message.kind(), channel, e);
            }
            Err(_) => {
                error!(
                    "[CONN] Write of {} to {} timed out after {:?}",
                    message.kind(),
                    channel,
                    self.config.write_timeout
                );
            }
        }
    }

    /// Drop messages queued while the link was down
    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("[CONN] Dropped {} message(s) queued while disconnected", dropped);
        }
    }

    /// Close the current or half-open link on the way out
    async fn release(&mut self) {
        if let Some(device) = self.current.take().or_else(|| self.pending.take()) {
            info!("[CONN] Closing link to {}", device);
            if let Err(e) = self.adapter.disconnect(&device).await {
                warn!("[CONN] Failed to close link to {}: {}", device, e);
            }
        }
        info!("[CONN] Connection manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockAdapter, RecordedWrite, ScanScript};
    use bytes::Bytes;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn start(adapter: &MockAdapter) -> ConnectionManager {
        let (sink, _rx) = NotificationSink::channel();
        ConnectionManager::start(
            ConnectionConfig::default(),
            adapter.clone(),
            sink,
            ShutdownSignal::new(),
        )
    }

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.backoff, Backoff::Fixed(Duration::from_secs(5)));
        assert_eq!(config.filter, DeviceFilter::new("DexHand"));
        assert_eq!(config.command_channel, gatt::UART_RX);
        assert_eq!(config.notify_channel, gatt::UART_TX);
        assert_eq!(config.stream_channel, gatt::DOF_STREAM);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::from_secs(5));
        for failures in [1, 2, 10, u32::MAX] {
            assert_eq!(backoff.delay(failures), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(16));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_subscribes() {
        let adapter = MockAdapter::with_device("DexHand-R");
        let manager = start(&adapter);
        let handle = manager.handle();

        wait_until(|| handle.state() == ConnectionState::Connected).await;

        assert_eq!(adapter.connect_count(), 1);
        assert_eq!(adapter.state().subscriptions, vec![gatt::UART_TX]);
        let connected = adapter.state().connected.clone().unwrap();
        assert_eq!(connected.name, "DexHand-R");
        assert_eq!(connected.link_id, 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_devices_not_matching_filter() {
        let adapter = MockAdapter::with_device("Headphones");
        let manager = start(&adapter);
        let handle = manager.handle();

        wait_until(|| adapter.scan_count() >= 3).await;
        assert_eq!(adapter.connect_count(), 0);
        assert_eq!(handle.state(), ConnectionState::Scanning);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_use_configured_channels() {
        let adapter = MockAdapter::with_device("DexHand");
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        handle
            .send(OutboundMessage::Command("home".into()))
            .unwrap();
        handle
            .send(OutboundMessage::StreamFrame(Bytes::from_static(&[0x01, 0xff])))
            .unwrap();
        wait_until(|| adapter.writes().len() == 2).await;

        assert_eq!(
            adapter.writes(),
            vec![
                RecordedWrite {
                    channel: gatt::UART_RX,
                    data: Bytes::from_static(b"home\n"),
                    ack_required: true,
                },
                RecordedWrite {
                    channel: gatt::DOF_STREAM,
                    data: Bytes::from_static(&[0x01, 0xff]),
                    ack_required: false,
                },
            ]
        );

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_persists_through_connect_failures() {
        let adapter = MockAdapter::with_device("DexHand");
        adapter.state().connect_failures = 5;
        let manager = start(&adapter);
        let handle = manager.handle();

        wait_until(|| handle.state() == ConnectionState::Connected).await;

        let attempts = adapter.state().connect_attempts.clone();
        assert_eq!(attempts.len(), 6);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_releases_link_and_retries() {
        let adapter = MockAdapter::with_device("DexHand");
        adapter.state().subscribe_failures = 2;
        let manager = start(&adapter);
        let handle = manager.handle();

        wait_until(|| handle.state() == ConnectionState::Connected).await;

        assert_eq!(adapter.connect_count(), 3);
        assert_eq!(adapter.state().disconnect_count, 2);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_fault_is_not_fatal() {
        let adapter = MockAdapter::with_device("DexHand");
        {
            let mut state = adapter.state();
            state.scans.push_back(ScanScript::Fault("adapter busy".into()));
            state.scans.push_back(ScanScript::Devices(Vec::new()));
        }
        let manager = start(&adapter);
        let handle = manager.handle();

        wait_until(|| handle.state() == ConnectionState::Connected).await;
        assert_eq!(adapter.scan_count(), 3);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_triggers_single_reconnect() {
        let adapter = MockAdapter::with_device("DexHand");
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        adapter.drop_link();
        // Duplicate signals for the same link are coalesced
        let first = adapter.state().notifiers[0].clone();
        first.notify();
        first.notify();

        wait_until(|| adapter.connect_count() == 2 && handle.state() == ConnectionState::Connected)
            .await;

        // Give a second reconnection every chance to show up
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(adapter.connect_count(), 2);
        assert_eq!(adapter.scan_count(), 2);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(adapter.state().connected.clone().unwrap().link_id, 2);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_loss_is_ignored() {
        let adapter = MockAdapter::with_device("DexHand");
        adapter.state().connect_failures = 1;
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        // Notifier of the failed first attempt fires late
        let stale = adapter.state().notifiers[0].clone();
        stale.notify();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(adapter.connect_count(), 2);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_queued_while_scanning_are_dropped() {
        let adapter = MockAdapter::with_device("DexHand");
        adapter
            .state()
            .scans
            .push_back(ScanScript::Devices(Vec::new()));
        let manager = start(&adapter);
        let handle = manager.handle();

        handle
            .send(OutboundMessage::Command("stale".into()))
            .unwrap();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        handle
            .send(OutboundMessage::Command("fresh".into()))
            .unwrap();
        wait_until(|| !adapter.writes().is_empty()).await;

        let writes = adapter.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data, Bytes::from_static(b"fresh\n"));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_keeps_connection() {
        let adapter = MockAdapter::with_device("DexHand");
        adapter.state().fail_writes = true;
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        handle
            .send(OutboundMessage::Command("grip".into()))
            .unwrap();
        handle
            .send(OutboundMessage::Command("release".into()))
            .unwrap();
        wait_until(|| adapter.writes().len() == 2).await;

        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(adapter.connect_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_skipped_when_adapter_reports_down() {
        let adapter = MockAdapter::with_device("DexHand");
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        // Link gone at the radio, link-loss signal not yet delivered
        adapter.state().connected = None;
        handle
            .send(OutboundMessage::Command("grip".into()))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(adapter.writes().is_empty());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_commands_query_the_radio() {
        let adapter = MockAdapter::with_device("DexHand");
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        for _ in 0..10 {
            handle
                .send(OutboundMessage::StreamFrame(Bytes::from_static(&[0x00])))
                .unwrap();
        }
        handle.send(OutboundMessage::Command("home".into())).unwrap();
        wait_until(|| adapter.writes().len() == 11).await;

        assert_eq!(adapter.state().is_connected_calls, 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_link() {
        let adapter = MockAdapter::with_device("DexHand");
        let manager = start(&adapter);
        let handle = manager.handle();
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        manager.shutdown().await;

        assert_eq!(adapter.state().disconnect_count, 1);
        assert!(adapter.state().connected.is_none());
        assert!(handle
            .send(OutboundMessage::Command("late".into()))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_subscribing_closes_link() {
        let adapter = MockAdapter::with_device("DexHand");
        adapter.state().subscribe_hangs = true;
        let manager = start(&adapter);
        let handle = manager.handle();

        wait_until(|| adapter.connect_count() == 1).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);

        timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .expect("shutdown should not wait for the subscribe");

        assert_eq!(adapter.state().disconnect_count, 1);
        assert!(adapter.state().connected.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_backing_off() {
        let adapter = MockAdapter::default();
        let manager = start(&adapter);

        wait_until(|| adapter.scan_count() >= 1).await;
        timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .expect("shutdown should not wait for the backoff");

        assert_eq!(adapter.state().disconnect_count, 0);
    }
}
