//! Bridge configuration
//!
//! Defaults match the hand controller. A handful of environment variables
//! override them at startup.

use crate::bus::BusConfig;
use crate::connection::{Backoff, ConnectionConfig};
use crate::transport::ScanConfig;
use bridge_shared::DeviceFilter;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_DEVICE_FILTER: &str = "BLE_BRIDGE_DEVICE_FILTER";
pub const ENV_BUS_ADDR: &str = "BLE_BRIDGE_BUS_ADDR";
pub const ENV_RETRY_SECS: &str = "BLE_BRIDGE_RETRY_SECS";
/// When set, backoff becomes exponential from the retry delay up to this cap
pub const ENV_BACKOFF_MAX_SECS: &str = "BLE_BRIDGE_BACKOFF_MAX_SECS";
pub const ENV_SCAN_SECS: &str = "BLE_BRIDGE_SCAN_SECS";

/// Complete bridge configuration
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub scan: ScanConfig,
    pub bus: BusConfig,
}

impl BridgeConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(filter) = lookup(ENV_DEVICE_FILTER).filter(|f| !f.is_empty()) {
            config.connection.filter = DeviceFilter::new(filter);
        }
        if let Some(addr) = lookup(ENV_BUS_ADDR).filter(|a| !a.is_empty()) {
            config.bus.listen_addr = addr;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SCAN_SECS) {
            config.scan.scan_duration = Duration::from_secs(secs);
        }

        let retry = parse_var::<u64>(&lookup, ENV_RETRY_SECS).map(Duration::from_secs);
        let max = parse_var::<u64>(&lookup, ENV_BACKOFF_MAX_SECS).map(Duration::from_secs);
        config.connection.backoff = match (retry, max) {
            (retry, Some(max)) => Backoff::Exponential {
                initial: retry.unwrap_or_else(|| config.connection.backoff.delay(1)),
                max,
            },
            (Some(retry), None) => Backoff::Fixed(retry),
            (None, None) => config.connection.backoff,
        };

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("[CONFIG] Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}
