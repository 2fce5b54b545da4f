//! Message bus gateway
//!
//! The bridge only needs named text channels with publish/subscribe. This
//! module provides:
//! - The `BusGateway` seam the bridges depend on
//! - An in-process hub of named channels
//! - A newline-delimited TCP front end so other processes can attach

pub mod local;
pub mod tcp;

use anyhow::Result;
use bridge_shared::topics;
use tokio::sync::broadcast;

pub use local::LocalBus;
pub use tcp::TcpBusGateway;

/// Publish/subscribe transport with named channels
pub trait BusGateway: Send + Sync + 'static {
    /// Deliver a message to every current subscriber of `channel`
    fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Receive every message published on `channel` from now on
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// Names of the three channels the bridge uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTopics {
    /// Input: plain-text commands
    pub command: String,
    /// Input: hex-encoded stream frames
    pub stream: String,
    /// Output: decoded notifications
    pub response: String,
}

impl Default for BusTopics {
    fn default() -> Self {
        Self {
            command: topics::COMMAND.into(),
            stream: topics::STREAM.into(),
            response: topics::RESPONSE.into(),
        }
    }
}

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub topics: BusTopics,
    /// Address the TCP gateway listens on
    pub listen_addr: String,
    /// Per-channel buffer; slower subscribers lose the oldest messages
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topics: BusTopics::default(),
            listen_addr: "127.0.0.1:7878".into(),
            capacity: 256,
        }
    }
}
