pub mod bluez;
#[cfg(test)]
pub mod mock;
pub mod traits;

pub use bluez::{BluerAdapter, ScanConfig};
pub use traits::{BleAdapter, LinkLost, LinkLossNotifier, NotificationSink};
