//! BLE peripheral backend for stepcast
//!
//! Implements the transport traits from `stepcast-core` against real hardware.
//!
//! ## Platform Support
//!
//! - **Linux**: GATT service and advertising through BlueZ via the `bluer`
//!   crate, controller commands over a raw HCI socket (needs `CAP_NET_RAW`)
//! - **Other platforms**: opening the device fails with
//!   [`DeviceOpenError::Unsupported`](stepcast_core::DeviceOpenError)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stepcast_core::{DeviceConfig, DeviceController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceConfig::default().with_target_steps(88888);
//! let device = stepcast_ble::open(&config).await?;
//! let controller = DeviceController::new(config, device.hci, device.peripheral, device.notifier)?;
//! controller.run(device.events).await;
//! # Ok(())
//! # }
//! ```

pub mod hci_packet;
mod platform;

#[cfg(target_os = "linux")]
pub use platform::{BluezPeripheral, HciSocket};
pub use platform::{open, OpenedPeripheral, EVENT_BUFFER};
