//! Serve the pedometer through the platform BLE backend

use stepcast_core::DeviceController;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::Result;

/// Open the BLE device and run the controller until interrupted
pub async fn run_device(config: &AppConfig) -> Result<()> {
    let device = stepcast_ble::open(&config.device).await?;
    let controller = DeviceController::new(
        config.device.clone(),
        device.hci,
        device.peripheral,
        device.notifier,
    )?;

    info!(
        "Serving {} steps as '{}' on hci{}",
        controller.steps(),
        config.device.device_name,
        config.device.hci_index
    );

    let mut runner = tokio::spawn(controller.run(device.events));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for interrupt: {}", e);
            }
            info!("Shutting down");
            runner.abort();
        }
        finished = &mut runner => {
            if let Err(e) = finished {
                error!("Device controller task failed: {}", e);
            }
            warn!("BLE transport closed");
        }
    }

    Ok(())
}
