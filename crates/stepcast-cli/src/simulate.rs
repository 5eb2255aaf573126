//! Scripted session against the virtual controller
//!
//! Drives the same device controller used with BlueZ through one full
//! lifecycle: power on, a central connects, reads the pedometer and address
//! characteristics, writes a target, subscribes, disconnects, power off.

use std::time::Duration;

use stepcast_core::services::{ADDRESS_READ_UUID, PEDOMETER_UUID, TARGET_UUID};
use stepcast_core::{
    AttStatus, ControllerState, DeviceController, HardwareAddress, PeerId, StepCount,
};
use stepcast_harness::{DeliveredNotification, VirtualController, VirtualControllerConfig};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Extra wait on top of the address timeout before giving up on power-on
const SETTLE_MARGIN: Duration = Duration::from_secs(1);

const NOTIFY_WAIT: Duration = Duration::from_secs(1);

/// What the simulated central observed
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// State reached after power-on
    pub powered_state: ControllerState,
    pub address: Option<HardwareAddress>,
    pub pedometer: std::result::Result<Vec<u8>, AttStatus>,
    pub target_write: AttStatus,
    pub notifications: Vec<DeliveredNotification>,
    /// State after the final power-off
    pub final_state: ControllerState,
}

async fn wait_for_state(
    state: &mut watch::Receiver<ControllerState>,
    limit: Duration,
    accept: impl FnMut(&ControllerState) -> bool,
) -> Result<ControllerState> {
    match tokio::time::timeout(limit, state.wait_for(accept)).await {
        Ok(Ok(reached)) => Ok(*reached),
        Ok(Err(_)) => Err(CliError::Simulation("device controller stopped".to_string())),
        Err(_) => Err(CliError::Simulation(format!(
            "no state change within {} ms",
            limit.as_millis()
        ))),
    }
}

/// Run the scripted session
pub async fn run_simulation(config: &AppConfig) -> Result<SimulationReport> {
    let mut virtual_config = VirtualControllerConfig::new();
    if config.simulation.hci_status != 0x00 {
        virtual_config = virtual_config.with_hci_status(config.simulation.hci_status);
    }

    let (sim, events) = VirtualController::new(virtual_config);
    let controller = DeviceController::with_transport(config.device.clone(), sim.clone())?;
    let steps: StepCount = controller.steps();
    let mut state = controller.subscribe_state();
    let runner = tokio::spawn(controller.run(events));

    info!("Starting simulated session");
    sim.power_on().await?;
    let settle = config.device.address_timeout() + SETTLE_MARGIN;
    let powered_state = wait_for_state(&mut state, settle, |s| {
        matches!(s, ControllerState::PoweredOn | ControllerState::Degraded)
    })
    .await?;
    info!("Device state: {}", powered_state);

    let central = PeerId::new(config.simulation.central.clone());
    sim.connect(&central).await?;

    let pedometer = sim.read(&central, PEDOMETER_UUID).await?;
    match &pedometer {
        Ok(value) => info!("Central read pedometer: {}", hex::encode(value)),
        Err(status) => warn!("Pedometer read failed: {:?}", status),
    }

    let address = match sim.read(&central, ADDRESS_READ_UUID).await? {
        Ok(value) => <[u8; 6]>::try_from(value.as_slice())
            .ok()
            .map(HardwareAddress::new),
        Err(status) => {
            warn!("Address read failed: {:?}", status);
            None
        }
    };
    if let Some(address) = &address {
        info!("Central read address: {}", address);
    }

    let target_write = sim
        .write(&central, TARGET_UUID, steps.encode().to_vec())
        .await?;
    info!("Target write status: {:?}", target_write);

    sim.subscribe(&central, PEDOMETER_UUID).await?;
    let notifications = sim
        .wait_for_notifications(1, NOTIFY_WAIT)
        .await
        .unwrap_or_default();
    for notification in &notifications {
        info!(
            "Central notified on {}: {}",
            notification.characteristic,
            hex::encode(&notification.payload)
        );
    }

    sim.disconnect(&central).await?;
    sim.power_off().await?;
    let final_state =
        wait_for_state(&mut state, settle, |s| *s == ControllerState::Off).await?;

    runner.abort();
    info!("Simulated session finished");

    Ok(SimulationReport {
        powered_state,
        address,
        pedometer,
        target_write,
        notifications,
        final_state,
    })
}
