//! Virtual controller
//!
//! Deterministic stand-in for a BLE adapter. Configurable latency on the
//! command and notify paths makes ordering and timeout behaviour observable in
//! tests.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stepcast_core::{
    AdvertisementPacket, AttStatus, ConnHandle, DeviceState, HciError, HciTransport, Notifier,
    PeerId, PeripheralTransport, RawCommand, ReadRequest, ServiceDescriptor, TransportError,
    TransportEvent, Uuid16, WriteRequest, READ_ADDRESS_OPCODE,
};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info};

/// First connection handle handed out
const FIRST_CONN_HANDLE: ConnHandle = 0x0040;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Scripted outcome of the address query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciScript {
    /// Return these parameters (status byte first)
    Respond(Vec<u8>),
    /// Fail at the transport level
    Fail(String),
    /// Never answer
    Hang,
}

/// Configuration for virtual controller behaviour
#[derive(Debug, Clone)]
pub struct VirtualControllerConfig {
    /// Answer to the address query
    pub hci_script: HciScript,
    /// Delay before the address query is answered
    pub hci_latency: Duration,
    /// Delay before each notification is delivered
    pub notify_latency: Duration,
    /// Reject service registration
    pub fail_service_registration: bool,
    /// Reject advertising start
    pub fail_advertising: bool,
    /// Capacity of the event channel
    pub event_buffer: usize,
}

impl Default for VirtualControllerConfig {
    fn default() -> Self {
        Self {
            // Wire order: address 66:55:44:33:22:11
            hci_script: HciScript::Respond(vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            hci_latency: Duration::ZERO,
            notify_latency: Duration::ZERO,
            fail_service_registration: false,
            fail_advertising: false,
            event_buffer: 64,
        }
    }
}

impl VirtualControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the address query with `params`
    pub fn with_hci_response(mut self, params: Vec<u8>) -> Self {
        self.hci_script = HciScript::Respond(params);
        self
    }

    /// Answer the address query with a bare status byte
    pub fn with_hci_status(self, status: u8) -> Self {
        self.with_hci_response(vec![status])
    }

    pub fn with_hci_script(mut self, script: HciScript) -> Self {
        self.hci_script = script;
        self
    }

    pub fn with_hci_latency(mut self, latency: Duration) -> Self {
        self.hci_latency = latency;
        self
    }

    pub fn with_notify_latency(mut self, latency: Duration) -> Self {
        self.notify_latency = latency;
        self
    }

    pub fn with_failing_service_registration(mut self) -> Self {
        self.fail_service_registration = true;
        self
    }

    pub fn with_failing_advertising(mut self) -> Self {
        self.fail_advertising = true;
        self
    }
}

// ----------------------------------------------------------------------------
// Recorded Activity
// ----------------------------------------------------------------------------

/// A transport call made by the device controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    RawCommand(RawCommand),
    AddService(ServiceDescriptor),
    RemoveService,
    StartAdvertising(AdvertisementPacket),
    StopAdvertising,
}

/// A notification that reached a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredNotification {
    pub peer: PeerId,
    pub handle: ConnHandle,
    pub characteristic: Uuid16,
    pub payload: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Virtual Controller
// ----------------------------------------------------------------------------

/// In-memory BLE adapter
pub struct VirtualController {
    config: VirtualControllerConfig,
    events: mpsc::Sender<TransportEvent>,
    calls: Mutex<Vec<RecordedCall>>,
    notifications: Mutex<Vec<DeliveredNotification>>,
    delivered: Notify,
    next_handle: AtomicU16,
}

impl VirtualController {
    /// Create a controller and the event stream to hand to the device
    /// controller
    pub fn new(config: VirtualControllerConfig) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, receiver) = mpsc::channel(config.event_buffer.max(1));
        let controller = Arc::new(Self {
            config,
            events,
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            delivered: Notify::new(),
            next_handle: AtomicU16::new(FIRST_CONN_HANDLE),
        });
        (controller, receiver)
    }

    pub fn config(&self) -> &VirtualControllerConfig {
        &self.config
    }

    async fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        debug!("Virtual controller emitting {}", event.kind());
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    // ------------------------------------------------------------------------
    // Event Injection
    // ------------------------------------------------------------------------

    pub async fn power_on(&self) -> Result<(), TransportError> {
        self.emit(TransportEvent::StateChanged(DeviceState::PoweredOn))
            .await
    }

    pub async fn power_off(&self) -> Result<(), TransportError> {
        self.emit(TransportEvent::StateChanged(DeviceState::Off)).await
    }

    /// Connect a central and return its connection handle
    pub async fn connect(&self, peer: &PeerId) -> Result<ConnHandle, TransportError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.emit(TransportEvent::CentralConnected {
            peer: peer.clone(),
            handle,
        })
        .await?;
        Ok(handle)
    }

    pub async fn disconnect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.emit(TransportEvent::CentralDisconnected { peer: peer.clone() })
            .await
    }

    /// Issue a read and wait for the answer. Requires a running event consumer.
    pub async fn read(
        &self,
        peer: &PeerId,
        characteristic: Uuid16,
    ) -> Result<Result<Vec<u8>, AttStatus>, TransportError> {
        let (respond, answer) = oneshot::channel();
        self.emit(TransportEvent::ReadRequest {
            characteristic,
            request: ReadRequest::new(peer.clone()),
            respond,
        })
        .await?;
        answer.await.map_err(|_| TransportError::Closed)
    }

    /// Issue a write and wait for the status. Requires a running event consumer.
    pub async fn write(
        &self,
        peer: &PeerId,
        characteristic: Uuid16,
        data: Vec<u8>,
    ) -> Result<AttStatus, TransportError> {
        let (respond, answer) = oneshot::channel();
        self.emit(TransportEvent::WriteRequest {
            characteristic,
            request: WriteRequest::new(peer.clone(), data),
            respond,
        })
        .await?;
        answer.await.map_err(|_| TransportError::Closed)
    }

    /// Subscribe `peer` to notifications on `characteristic`
    pub async fn subscribe(
        &self,
        peer: &PeerId,
        characteristic: Uuid16,
    ) -> Result<(), TransportError> {
        self.emit(TransportEvent::NotifyRequest {
            peer: peer.clone(),
            characteristic,
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn raw_commands(&self) -> Vec<RawCommand> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                RecordedCall::RawCommand(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn services(&self) -> Vec<ServiceDescriptor> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                RecordedCall::AddService(service) => Some(service.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn advertisements(&self) -> Vec<AdvertisementPacket> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                RecordedCall::StartAdvertising(packet) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn notifications(&self) -> Vec<DeliveredNotification> {
        self.notifications.lock().await.clone()
    }

    /// Wait until at least `count` notifications were delivered
    pub async fn wait_for_notifications(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<DeliveredNotification>> {
        let wait = async {
            loop {
                let signal = self.delivered.notified();
                {
                    let delivered = self.notifications.lock().await;
                    if delivered.len() >= count {
                        return delivered.clone();
                    }
                }
                signal.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    async fn record(&self, call: RecordedCall) {
        self.calls.lock().await.push(call);
    }
}

// ----------------------------------------------------------------------------
// Transport Implementations
// ----------------------------------------------------------------------------

#[async_trait]
impl HciTransport for VirtualController {
    async fn send_raw_command(&self, command: RawCommand) -> Result<Vec<u8>, HciError> {
        let opcode = command.opcode;
        self.record(RecordedCall::RawCommand(command)).await;

        if opcode != READ_ADDRESS_OPCODE {
            return Err(HciError::TransportError(format!(
                "virtual controller does not implement opcode 0x{:04x}",
                opcode.to_raw()
            )));
        }

        if !self.config.hci_latency.is_zero() {
            tokio::time::sleep(self.config.hci_latency).await;
        }

        match &self.config.hci_script {
            HciScript::Respond(params) => Ok(params.clone()),
            HciScript::Fail(reason) => Err(HciError::TransportError(reason.clone())),
            HciScript::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl PeripheralTransport for VirtualController {
    async fn add_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError> {
        self.record(RecordedCall::AddService(service.clone())).await;
        if self.config.fail_service_registration {
            return Err(TransportError::ServiceRegistration(
                "rejected by virtual controller".to_string(),
            ));
        }
        info!(
            "Virtual controller serving {} ({} characteristics)",
            service.uuid,
            service.characteristics.len()
        );
        Ok(())
    }

    async fn remove_service(&self) -> Result<(), TransportError> {
        self.record(RecordedCall::RemoveService).await;
        Ok(())
    }

    async fn start_advertising(&self, packet: &AdvertisementPacket) -> Result<(), TransportError> {
        self.record(RecordedCall::StartAdvertising(packet.clone()))
            .await;
        if self.config.fail_advertising {
            return Err(TransportError::Advertising(
                "rejected by virtual controller".to_string(),
            ));
        }
        info!("Virtual controller advertising {} bytes", packet.len());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.record(RecordedCall::StopAdvertising).await;
        Ok(())
    }
}

#[async_trait]
impl Notifier for VirtualController {
    async fn notify(
        &self,
        peer: &PeerId,
        handle: ConnHandle,
        characteristic: Uuid16,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !self.config.notify_latency.is_zero() {
            tokio::time::sleep(self.config.notify_latency).await;
        }

        self.notifications.lock().await.push(DeliveredNotification {
            peer: peer.clone(),
            handle,
            characteristic,
            payload: payload.to_vec(),
        });
        self.delivered.notify_waiters();
        Ok(())
    }
}
