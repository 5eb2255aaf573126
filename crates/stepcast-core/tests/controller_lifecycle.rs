//! Lifecycle tests for the device controller
//!
//! Drive the controller against the virtual controller and check the
//! sequencing of address resolution, service registration and advertising
//! across power cycles and failures.

use std::time::Duration;

use stepcast_core::services::{ADDRESS_READ_UUID, PEDOMETER_UUID, TARGET_UUID};
use stepcast_core::{
    AddressSource, AdvertisementError, AttStatus, ConfigError, ControllerState, DeviceConfig,
    DeviceController, HardwareAddress, PeerId, StepcastError, TransportError, TransportEvent,
};
use stepcast_harness::{HciScript, RecordedCall, VirtualController, VirtualControllerConfig};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn scenario_address_response() -> Vec<u8> {
    vec![0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
}

fn setup(
    config: DeviceConfig,
    sim_config: VirtualControllerConfig,
) -> (
    DeviceController,
    std::sync::Arc<VirtualController>,
    mpsc::Receiver<TransportEvent>,
) {
    let (sim, events) = VirtualController::new(sim_config);
    let controller = DeviceController::with_transport(config, sim.clone()).unwrap();
    (controller, sim, events)
}

/// Feed every queued event to the controller
async fn pump(
    controller: &mut DeviceController,
    events: &mut mpsc::Receiver<TransportEvent>,
) -> Vec<Result<(), StepcastError>> {
    let mut results = Vec::new();
    while let Ok(event) = events.try_recv() {
        results.push(controller.handle_event(event).await);
    }
    results
}

async fn wait_for_state(rx: &mut watch::Receiver<ControllerState>, wanted: ControllerState) {
    timeout(Duration::from_secs(1), async {
        while *rx.borrow_and_update() != wanted {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("controller should reach the expected state");
}

// ----------------------------------------------------------------------------
// Power-On Sequencing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_power_on_resolves_address_and_advertises() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default(),
        VirtualControllerConfig::new().with_hci_response(scenario_address_response()),
    );
    assert_eq!(controller.state(), ControllerState::Off);

    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;

    assert_eq!(controller.state(), ControllerState::PoweredOn);
    let published = controller.published_address().unwrap();
    assert_eq!(published.address.to_string(), "FF:EE:DD:CC:BB:AA");
    assert_eq!(published.source, AddressSource::Resolved);

    let calls = sim.calls().await;
    assert_eq!(calls.len(), 3);
    assert!(matches!(calls[0], RecordedCall::RawCommand(ref c) if c.opcode.to_raw() == 0x1009));
    assert!(matches!(calls[1], RecordedCall::AddService(ref s) if s.uuid.value() == 0xFEE7));
    assert!(matches!(calls[2], RecordedCall::StartAdvertising(_)));

    let packet = &sim.advertisements().await[0];
    assert_eq!(packet.local_name().as_deref(), Some("WeixinBLE"));
    assert_eq!(
        packet.manufacturer_data(),
        Some((0x2333, vec![0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]))
    );
}

#[tokio::test]
async fn test_repeated_power_on_is_ignored() {
    let (mut controller, sim, mut events) =
        setup(DeviceConfig::default(), VirtualControllerConfig::default());

    sim.power_on().await.unwrap();
    sim.power_on().await.unwrap();
    let results = pump(&mut controller, &mut events).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(sim.services().await.len(), 1);
    assert_eq!(sim.advertisements().await.len(), 1);
    assert_eq!(sim.raw_commands().await.len(), 1);
}

#[tokio::test]
async fn test_failed_status_degrades_to_zero_address() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default(),
        VirtualControllerConfig::new().with_hci_status(0x01),
    );

    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;

    assert_eq!(controller.state(), ControllerState::Degraded);
    let published = controller.published_address().unwrap();
    assert_eq!(published.address, HardwareAddress::ZERO);
    assert_eq!(published.source, AddressSource::Fallback);

    // Registration and advertising still complete
    assert!(controller.registry().is_live());
    assert_eq!(sim.services().await.len(), 1);
    assert_eq!(
        sim.advertisements().await[0].manufacturer_data(),
        Some((0x2333, vec![0; 6]))
    );
}

#[tokio::test]
async fn test_unanswered_address_query_times_out() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default().with_address_timeout(Duration::from_millis(20)),
        VirtualControllerConfig::new().with_hci_script(HciScript::Hang),
    );

    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;

    assert_eq!(controller.state(), ControllerState::Degraded);
    assert!(controller.published_address().unwrap().address.is_zero());
    assert_eq!(sim.advertisements().await.len(), 1);
}

#[tokio::test]
async fn test_transport_failure_on_hci_degrades() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default(),
        VirtualControllerConfig::new().with_hci_script(HciScript::Fail("socket closed".into())),
    );

    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;
    assert_eq!(controller.state(), ControllerState::Degraded);
}

// ----------------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_out_of_range_steps_rejected_before_any_activity() {
    let (sim, _events) = VirtualController::new(VirtualControllerConfig::default());
    let result = DeviceController::with_transport(
        DeviceConfig::default().with_target_steps(100_001),
        sim.clone(),
    );

    assert!(matches!(
        result,
        Err(StepcastError::Config(ConfigError::StepsOutOfRange {
            value: 100_001,
            max: 100_000
        }))
    ));
    assert!(sim.calls().await.is_empty());
}

// ----------------------------------------------------------------------------
// Power Cycles
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_power_cycle_reregisters_without_resolving_again() {
    let (mut controller, sim, mut events) =
        setup(DeviceConfig::default(), VirtualControllerConfig::default());
    let peer = PeerId::new("central");

    sim.power_on().await.unwrap();
    sim.connect(&peer).await.unwrap();
    pump(&mut controller, &mut events).await;
    assert_eq!(controller.peers().len().await, 1);

    sim.power_off().await.unwrap();
    pump(&mut controller, &mut events).await;
    assert_eq!(controller.state(), ControllerState::Off);
    assert!(!controller.registry().is_live());
    assert!(controller.peers().is_empty().await);

    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;
    assert_eq!(controller.state(), ControllerState::PoweredOn);

    assert_eq!(sim.raw_commands().await.len(), 1);
    assert_eq!(sim.services().await.len(), 2);
    let calls = sim.calls().await;
    assert!(calls.contains(&RecordedCall::StopAdvertising));
    assert!(calls.contains(&RecordedCall::RemoveService));
}

#[tokio::test]
async fn test_degraded_address_survives_power_cycle() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default(),
        VirtualControllerConfig::new().with_hci_status(0x0C),
    );

    sim.power_on().await.unwrap();
    sim.power_off().await.unwrap();
    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;

    assert_eq!(controller.state(), ControllerState::Degraded);
    assert_eq!(sim.raw_commands().await.len(), 1);
}

#[tokio::test]
async fn test_power_off_while_off_is_noop() {
    let (mut controller, sim, mut events) =
        setup(DeviceConfig::default(), VirtualControllerConfig::default());

    sim.power_off().await.unwrap();
    pump(&mut controller, &mut events).await;
    assert_eq!(controller.state(), ControllerState::Off);
    assert!(sim.calls().await.is_empty());
}

// ----------------------------------------------------------------------------
// Setup Failures
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_advertising_failure_rolls_back() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default(),
        VirtualControllerConfig::new().with_failing_advertising(),
    );

    sim.power_on().await.unwrap();
    let results = pump(&mut controller, &mut events).await;

    assert!(matches!(
        results[0],
        Err(StepcastError::Transport(TransportError::Advertising(_)))
    ));
    assert_eq!(controller.state(), ControllerState::Off);
    assert!(!controller.registry().is_live());
    assert!(sim.calls().await.contains(&RecordedCall::RemoveService));

    // A later power-on retries setup with the already published address
    sim.power_on().await.unwrap();
    pump(&mut controller, &mut events).await;
    assert_eq!(sim.services().await.len(), 2);
    assert_eq!(sim.raw_commands().await.len(), 1);
}

#[tokio::test]
async fn test_service_registration_failure_is_reported() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default(),
        VirtualControllerConfig::new().with_failing_service_registration(),
    );

    sim.power_on().await.unwrap();
    let results = pump(&mut controller, &mut events).await;

    assert!(matches!(
        results[0],
        Err(StepcastError::Transport(TransportError::ServiceRegistration(_)))
    ));
    assert_eq!(controller.state(), ControllerState::Off);
    assert!(sim.advertisements().await.is_empty());
}

#[tokio::test]
async fn test_oversized_advertisement_is_surfaced() {
    let (mut controller, sim, mut events) = setup(
        DeviceConfig::default().with_device_name("N".repeat(40)),
        VirtualControllerConfig::default(),
    );

    sim.power_on().await.unwrap();
    let results = pump(&mut controller, &mut events).await;

    assert!(matches!(
        results[0],
        Err(StepcastError::Advertisement(AdvertisementError::TooLarge { .. }))
    ));
    assert!(sim.advertisements().await.is_empty());
    assert_eq!(controller.state(), ControllerState::Off);
}

// ----------------------------------------------------------------------------
// Requests Through the Event Loop
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_reads_and_writes_through_run_loop() {
    let (controller, sim, events) = setup(
        DeviceConfig::default().with_target_steps(88888),
        VirtualControllerConfig::new().with_hci_response(scenario_address_response()),
    );
    let mut state = controller.subscribe_state();
    let runner = tokio::spawn(controller.run(events));
    let peer = PeerId::new("central");

    // Nothing is served before power-on
    assert_eq!(
        sim.read(&peer, PEDOMETER_UUID).await.unwrap(),
        Err(AttStatus::AttributeNotFound)
    );

    sim.power_on().await.unwrap();
    wait_for_state(&mut state, ControllerState::PoweredOn).await;

    assert_eq!(
        sim.read(&peer, PEDOMETER_UUID).await.unwrap(),
        Ok(vec![0x01, 0x38, 0x5B, 0x01])
    );
    assert_eq!(
        sim.read(&peer, TARGET_UUID).await.unwrap(),
        Ok(vec![0x01, 0x38, 0x5B, 0x01])
    );
    assert_eq!(
        sim.read(&peer, ADDRESS_READ_UUID).await.unwrap(),
        Ok(vec![0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA])
    );
    assert_eq!(
        sim.write(&peer, TARGET_UUID, vec![0xDE, 0xAD]).await.unwrap(),
        AttStatus::Success
    );
    assert_eq!(
        sim.write(&peer, ADDRESS_READ_UUID, vec![0x00]).await.unwrap(),
        AttStatus::WriteNotPermitted
    );

    runner.abort();
}

#[tokio::test]
async fn test_strict_writes_through_run_loop() {
    let (controller, sim, events) = setup(
        DeviceConfig::default().with_strict_target_writes(true),
        VirtualControllerConfig::default(),
    );
    let mut state = controller.subscribe_state();
    tokio::spawn(controller.run(events));
    let peer = PeerId::new("central");

    sim.power_on().await.unwrap();
    wait_for_state(&mut state, ControllerState::PoweredOn).await;

    assert_eq!(
        sim.write(&peer, TARGET_UUID, vec![0x01, 0x10, 0x27, 0x00])
            .await
            .unwrap(),
        AttStatus::Success
    );
    assert_eq!(
        sim.write(&peer, TARGET_UUID, vec![0x07, 0x10, 0x27, 0x00])
            .await
            .unwrap(),
        AttStatus::InvalidPayload
    );
}
