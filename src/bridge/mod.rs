//! Translation between bus channels and GATT attributes

pub mod inbound;
pub mod outbound;

pub use inbound::InboundBridge;
pub use outbound::OutboundBridge;
