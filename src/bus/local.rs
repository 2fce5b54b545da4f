//! In-process bus: one broadcast channel per name, created on first use

use super::BusGateway;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

pub struct LocalBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl BusGateway for LocalBus {
    fn publish(&self, channel: &str, payload: String) -> Result<()> {
        match self.sender(channel).send(payload) {
            Ok(receivers) => debug!("[BUS] {} -> {} subscriber(s)", channel, receivers),
            // Nobody listening is not an error on a pub/sub bus
            Err(_) => debug!("[BUS] {} has no subscribers", channel),
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}
