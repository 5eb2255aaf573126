//! Platform-specific peripheral backends

use std::sync::Arc;

use stepcast_core::{
    DeviceConfig, DeviceOpenError, HciTransport, Notifier, PeripheralTransport, TransportEvent,
};
use tokio::sync::mpsc;

#[cfg(target_os = "linux")]
mod bluez;
#[cfg(target_os = "linux")]
mod hci_socket;

#[cfg(not(target_os = "linux"))]
mod fallback;

#[cfg(target_os = "linux")]
pub use bluez::BluezPeripheral;
#[cfg(target_os = "linux")]
pub use hci_socket::HciSocket;

/// Capacity of the transport event channel
pub const EVENT_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Opened Peripheral
// ----------------------------------------------------------------------------

/// An opened platform backend, split into the roles the device controller
/// consumes
pub struct OpenedPeripheral {
    pub hci: Arc<dyn HciTransport>,
    pub peripheral: Arc<dyn PeripheralTransport>,
    pub notifier: Arc<dyn Notifier>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for OpenedPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedPeripheral").finish_non_exhaustive()
    }
}

/// Open the BLE device for the configured adapter
pub async fn open(config: &DeviceConfig) -> Result<OpenedPeripheral, DeviceOpenError> {
    #[cfg(target_os = "linux")]
    {
        let (backend, events) = BluezPeripheral::open(config).await?;
        Ok(OpenedPeripheral {
            hci: backend.clone(),
            peripheral: backend.clone(),
            notifier: backend,
            events,
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        fallback::open(config)
    }
}
