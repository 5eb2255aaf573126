//! Device lifecycle controller
//!
//! Consumes transport events from a single channel and sequences power-on
//! setup: resolve the controller address, register the pedometer service,
//! build the advertisement and start advertising. Setup runs at most once per
//! power cycle. The address is resolved at most once per process.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::address::{AddressCell, PublishedAddress};
use crate::config::DeviceConfig;
use crate::dispatcher::{NotificationDispatcher, NotifyJob, NotifyTicket};
use crate::errors::{DispatchError, Result};
use crate::gatt::{AttStatus, CharacteristicRegistry, ReadRequest, Uuid16, WriteRequest};
use crate::hci::AddressResolver;
use crate::peers::{ConnHandle, ConnectedPeers, PeerId};
use crate::services::{pedometer_advertisement, pedometer_characteristics, PEDOMETER_SERVICE_UUID};
use crate::step_record::StepCount;
use crate::transport::{DeviceState, HciTransport, Notifier, PeripheralTransport, TransportEvent};

// ----------------------------------------------------------------------------
// Controller State
// ----------------------------------------------------------------------------

/// Lifecycle state of the emulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Radio off, nothing published
    Off,
    /// Power-on setup in progress
    Initializing,
    /// Advertising with the resolved address
    PoweredOn,
    /// Advertising with the zero address after a failed address query
    Degraded,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Off => "off",
            ControllerState::Initializing => "initializing",
            ControllerState::PoweredOn => "powered-on",
            ControllerState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Device Controller
// ----------------------------------------------------------------------------

/// Top-level state machine for the peripheral
pub struct DeviceController {
    config: DeviceConfig,
    steps: StepCount,
    state: ControllerState,
    state_tx: watch::Sender<ControllerState>,
    address: AddressCell,
    resolver: AddressResolver,
    registry: CharacteristicRegistry,
    peers: ConnectedPeers,
    dispatcher: NotificationDispatcher,
    peripheral: Arc<dyn PeripheralTransport>,
}

impl DeviceController {
    /// Create a controller. Validates the configuration first, so an invalid
    /// step count never reaches the transport.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: DeviceConfig,
        hci: Arc<dyn HciTransport>,
        peripheral: Arc<dyn PeripheralTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let steps = config.step_count()?;
        let peers = ConnectedPeers::new();
        let (state_tx, _) = watch::channel(ControllerState::Off);

        Ok(Self {
            resolver: AddressResolver::new(hci, config.address_timeout()),
            dispatcher: NotificationDispatcher::spawn(notifier, peers.clone()),
            config,
            steps,
            state: ControllerState::Off,
            state_tx,
            address: AddressCell::new(),
            registry: CharacteristicRegistry::new(),
            peers,
            peripheral,
        })
    }

    /// Create a controller over a single backend implementing every transport
    /// trait
    pub fn with_transport<T>(config: DeviceConfig, transport: Arc<T>) -> Result<Self>
    where
        T: HciTransport + PeripheralTransport + Notifier + 'static,
    {
        Self::new(config, transport.clone(), transport.clone(), transport)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn steps(&self) -> StepCount {
        self.steps
    }

    pub fn published_address(&self) -> Option<&PublishedAddress> {
        self.address.get()
    }

    pub fn registry(&self) -> &CharacteristicRegistry {
        &self.registry
    }

    pub fn peers(&self) -> ConnectedPeers {
        self.peers.clone()
    }

    /// Consume events until the channel closes
    pub async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        info!("Device controller started");

        while let Some(event) = events.recv().await {
            let kind = event.kind();
            if let Err(e) = self.handle_event(event).await {
                error!("Error handling {} event: {}", kind, e);
            }
        }

        self.dispatcher.shutdown().await;
        info!("Device controller stopped");
    }

    /// Process a single transport event
    pub async fn handle_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::StateChanged(DeviceState::PoweredOn) => self.power_on().await,
            TransportEvent::StateChanged(other) => {
                self.power_off(other).await;
                Ok(())
            }
            TransportEvent::CentralConnected { peer, handle } => {
                self.central_connected(peer, handle).await;
                Ok(())
            }
            TransportEvent::CentralDisconnected { peer } => {
                self.central_disconnected(peer).await;
                Ok(())
            }
            TransportEvent::ReadRequest {
                characteristic,
                request,
                respond,
            } => {
                self.read_request(characteristic, request, respond);
                Ok(())
            }
            TransportEvent::WriteRequest {
                characteristic,
                request,
                respond,
            } => {
                self.write_request(characteristic, request, respond);
                Ok(())
            }
            TransportEvent::NotifyRequest {
                peer,
                characteristic,
            } => {
                // Outcome is logged by the dispatcher
                self.notify(peer, characteristic)?;
                Ok(())
            }
        }
    }

    /// Submit a notify push for `characteristic` to `peer`. Returns without
    /// waiting for delivery.
    pub fn notify(&self, peer: PeerId, characteristic: Uuid16) -> Result<NotifyTicket> {
        let payload = self
            .registry
            .notify_payload(characteristic, &peer)
            .map_err(|status| {
                warn!(
                    "Notify on {} for {} refused: {}",
                    characteristic, peer, status
                );
                DispatchError::Refused {
                    characteristic,
                    status,
                }
            })?;

        let ticket = self.dispatcher.submit(NotifyJob {
            peer,
            characteristic,
            payload,
        })?;
        Ok(ticket)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    async fn power_on(&mut self) -> Result<()> {
        if self.state != ControllerState::Off {
            debug!("Ignoring power-on while {}", self.state);
            return Ok(());
        }

        info!("Adapter powered on, starting setup");
        self.set_state(ControllerState::Initializing);

        match self.setup().await {
            Ok(published) => {
                let next = if published.is_resolved() {
                    ControllerState::PoweredOn
                } else {
                    ControllerState::Degraded
                };
                self.set_state(next);
                info!(
                    "Advertising as {} ({}) with {} steps",
                    self.config.device_name, published.address, self.steps
                );
                Ok(())
            }
            Err(e) => {
                error!("Power-on setup failed: {}", e);
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn setup(&mut self) -> Result<PublishedAddress> {
        let published = self.publish_address().await;

        let handle = self.registry.register_service(
            PEDOMETER_SERVICE_UUID,
            pedometer_characteristics(&self.config, self.steps, published.address),
        )?;
        self.peripheral.add_service(handle.descriptor()).await?;

        let packet = pedometer_advertisement(&self.config, published.address)?;
        debug!("Advertisement payload: {}", hex::encode(packet.as_bytes()));
        self.peripheral.start_advertising(&packet).await?;

        Ok(published)
    }

    /// Resolve and publish the address on first use; reuse it afterwards
    async fn publish_address(&mut self) -> PublishedAddress {
        if let Some(published) = self.address.get() {
            debug!("Reusing published address {}", published.address);
            return *published;
        }

        let published = match self.resolver.resolve().await {
            Ok(address) => PublishedAddress::resolved(address),
            Err(e) => {
                warn!("Address query failed, publishing zero address: {}", e);
                PublishedAddress::fallback()
            }
        };

        if let Err(rejected) = self.address.publish(published) {
            // Unreachable while this task is the only writer
            warn!("Address already published, dropping {:?}", rejected);
        }
        self.address.get().copied().unwrap_or(published)
    }

    async fn rollback(&mut self) {
        if self.registry.clear().is_some() {
            if let Err(e) = self.peripheral.remove_service().await {
                warn!("Failed to withdraw service during rollback: {}", e);
            }
        }
        self.set_state(ControllerState::Off);
    }

    async fn power_off(&mut self, reported: DeviceState) {
        if self.state == ControllerState::Off {
            debug!("Adapter state {:?} while already off", reported);
            return;
        }

        info!("Adapter left powered-on state ({:?}), tearing down", reported);
        if let Err(e) = self.peripheral.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
        if self.registry.clear().is_some() {
            if let Err(e) = self.peripheral.remove_service().await {
                warn!("Failed to withdraw service: {}", e);
            }
        }
        self.peers.clear().await;
        self.set_state(ControllerState::Off);
    }

    fn set_state(&mut self, state: ControllerState) {
        if self.state != state {
            debug!("Controller state {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    // ------------------------------------------------------------------------
    // Connections and Requests
    // ------------------------------------------------------------------------

    async fn central_connected(&mut self, peer: PeerId, handle: ConnHandle) {
        info!("Central connected: {} (handle 0x{:04x})", peer, handle);
        if let Some(previous) = self.peers.connect(peer.clone(), handle).await {
            debug!("{} replaced stale handle 0x{:04x}", peer, previous);
        }
    }

    async fn central_disconnected(&mut self, peer: PeerId) {
        info!("Central disconnected: {}", peer);
        if self.peers.disconnect(&peer).await.is_none() {
            debug!("Disconnect for unknown central {}", peer);
        }
    }

    fn read_request(
        &self,
        characteristic: Uuid16,
        request: ReadRequest,
        respond: oneshot::Sender<std::result::Result<Vec<u8>, AttStatus>>,
    ) {
        let result = self.registry.read(characteristic, &request);
        if let Err(status) = &result {
            debug!(
                "Read {} by {} refused: {}",
                characteristic, request.peer, status
            );
        }
        if respond.send(result).is_err() {
            debug!("Read requester for {} went away", characteristic);
        }
    }

    fn write_request(
        &self,
        characteristic: Uuid16,
        request: WriteRequest,
        respond: oneshot::Sender<AttStatus>,
    ) {
        let status = self.registry.write(characteristic, &request);
        if !status.is_success() {
            debug!(
                "Write {} by {} refused: {}",
                characteristic, request.peer, status
            );
        }
        if respond.send(status).is_err() {
            debug!("Write requester for {} went away", characteristic);
        }
    }
}
