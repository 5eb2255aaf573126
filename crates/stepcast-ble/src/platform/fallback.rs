//! Fallback for platforms without peripheral support

use stepcast_core::{DeviceConfig, DeviceOpenError};
use tracing::warn;

use super::OpenedPeripheral;

pub fn open(config: &DeviceConfig) -> Result<OpenedPeripheral, DeviceOpenError> {
    warn!(
        "BLE peripheral mode not supported on this platform. Device '{}' cannot be opened; \
        use Linux with BlueZ, or run with --simulate.",
        config.device_name
    );
    Err(DeviceOpenError::Unsupported(
        std::env::consts::OS.to_string(),
    ))
}
