//! BLE Serial Bridge Shared Types
//!
//! This crate provides the transport-agnostic pieces of the bridge: GATT
//! identifiers, bus topic names, the link state machine and the payload codec.

pub mod codec;
pub mod state_machine;

use bytes::Bytes;
use std::fmt;

pub use state_machine::ConnectionState;
pub use uuid::Uuid;

/// Identifier of a GATT characteristic
pub type AttributeId = Uuid;

/// GATT services and characteristics exposed by the hand controller
pub mod gatt {
    use super::AttributeId;

    /// Nordic UART service
    pub const UART_SERVICE: AttributeId =
        AttributeId::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

    /// UART RX: the bridge writes commands here (write with response)
    pub const UART_RX: AttributeId =
        AttributeId::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

    /// UART TX: the peripheral notifies responses here
    pub const UART_TX: AttributeId =
        AttributeId::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

    /// Degrees-of-freedom streaming service
    pub const DOF_SERVICE: AttributeId =
        AttributeId::from_u128(0x1e16c1b4_1936_4f0e_ab62_5e0a702a4935);

    /// DOF stream: the bridge writes joint frames here (write without response)
    pub const DOF_STREAM: AttributeId =
        AttributeId::from_u128(0x1e16c1b5_1936_4f0e_ab62_5e0a702a4935);

    /// Services whose characteristics the bridge resolves after connecting
    pub const BRIDGED_SERVICES: [AttributeId; 2] = [UART_SERVICE, DOF_SERVICE];
}

/// Default bus channel names
pub mod topics {
    /// Plain-text commands for the peripheral
    pub const COMMAND: &str = "dexhand_hw_command";

    /// Hex-encoded streaming frames for the peripheral
    pub const STREAM: &str = "dexhand_dof_stream";

    /// Decoded notifications from the peripheral
    pub const RESPONSE: &str = "dexhand_hw_response";
}

/// Link timing defaults
pub mod link {
    /// Fixed delay between failed reconnection attempts
    pub const RETRY_DELAY_MS: u64 = 5000;

    /// How long a single discovery scan runs
    pub const SCAN_DURATION_MS: u64 = 5000;

    /// Default advertised-name substring of the peripheral
    pub const DEVICE_NAME_FILTER: &str = "DexHand";
}

/// A discovered peripheral matching the name filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Identifies one connection attempt; assigned by the connection manager
    pub link_id: u64,
    /// Bluetooth address as reported by the stack (e.g. "AA:BB:CC:DD:EE:FF")
    pub address: String,
    /// Advertised name
    pub name: String,
}

impl DeviceHandle {
    /// Create a handle for a freshly discovered device
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            link_id: 0,
            address: address.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Substring the advertised name must contain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter(pub String);

impl DeviceFilter {
    pub fn new(substring: impl Into<String>) -> Self {
        Self(substring.into())
    }

    /// Check whether an advertised name matches this filter
    pub fn matches(&self, name: &str) -> bool {
        name.contains(self.0.as_str())
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::new(link::DEVICE_NAME_FILTER)
    }
}

/// A message on its way from the bus to the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Text command, written with response
    Command(String),
    /// Raw streaming frame, written without response
    StreamFrame(Bytes),
}

impl OutboundMessage {
    /// Whether the write needs a flow-control acknowledgement
    pub fn ack_required(&self) -> bool {
        matches!(self, OutboundMessage::Command(_))
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Command(_) => "CMD",
            OutboundMessage::StreamFrame(_) => "DOF",
        }
    }
}

/// A raw payload pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNotification {
    pub channel: AttributeId,
    pub data: Vec<u8>,
}

impl InboundNotification {
    pub fn new(channel: AttributeId, data: Vec<u8>) -> Self {
        Self { channel, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_uuids() {
        assert_eq!(
            gatt::UART_RX.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            gatt::DOF_STREAM.to_string(),
            "1e16c1b5-1936-4f0e-ab62-5e0a702a4935"
        );
        assert_eq!(
            gatt::BRIDGED_SERVICES.map(|id| id.to_string()),
            [
                "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
                "1e16c1b4-1936-4f0e-ab62-5e0a702a4935".to_string(),
            ]
        );
    }

    #[test]
    fn test_device_filter() {
        let filter = DeviceFilter::default();
        assert!(filter.matches("DexHand-Left"));
        assert!(filter.matches("My DexHand"));
        assert!(!filter.matches("dexhand"));
        assert!(!filter.matches(""));
    }

    #[test]
    fn test_outbound_ack_policy() {
        assert!(OutboundMessage::Command("ping".into()).ack_required());
        assert!(!OutboundMessage::StreamFrame(Bytes::from_static(&[1, 2])).ack_required());
    }
}
