//! Transport abstraction for the peripheral
//!
//! A backend owns the radio. It executes raw controller commands, publishes
//! services and advertisements on request, pushes notifications, and reports
//! everything that happens on the link as [`TransportEvent`]s on a single
//! channel consumed by the device controller.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::advertising::AdvertisementPacket;
use crate::errors::{HciError, TransportError};
use crate::gatt::{AttStatus, ReadRequest, ServiceDescriptor, Uuid16, WriteRequest};
use crate::hci::RawCommand;
use crate::peers::{ConnHandle, PeerId};

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Raw controller command channel
#[async_trait]
pub trait HciTransport: Send + Sync {
    /// Send a command and return the return parameters of the matching
    /// completion event (status byte first)
    async fn send_raw_command(&self, command: RawCommand) -> Result<Vec<u8>, HciError>;
}

/// Service publication and advertising
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Publish a service. Requests for it arrive as transport events.
    async fn add_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError>;

    /// Withdraw the published service
    async fn remove_service(&self) -> Result<(), TransportError>;

    async fn start_advertising(&self, packet: &AdvertisementPacket) -> Result<(), TransportError>;

    async fn stop_advertising(&self) -> Result<(), TransportError>;
}

/// Pushes characteristic values to subscribed peers
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        peer: &PeerId,
        handle: ConnHandle,
        characteristic: Uuid16,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Power state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Off,
    PoweredOn,
    Other,
}

/// Events emitted by a backend
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(DeviceState),
    CentralConnected {
        peer: PeerId,
        handle: ConnHandle,
    },
    CentralDisconnected {
        peer: PeerId,
    },
    ReadRequest {
        characteristic: Uuid16,
        request: ReadRequest,
        respond: oneshot::Sender<Result<Vec<u8>, AttStatus>>,
    },
    WriteRequest {
        characteristic: Uuid16,
        request: WriteRequest,
        respond: oneshot::Sender<AttStatus>,
    },
    /// A peer subscribed to a notifiable characteristic
    NotifyRequest {
        peer: PeerId,
        characteristic: Uuid16,
    },
}

impl TransportEvent {
    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::StateChanged(_) => "state-changed",
            TransportEvent::CentralConnected { .. } => "central-connected",
            TransportEvent::CentralDisconnected { .. } => "central-disconnected",
            TransportEvent::ReadRequest { .. } => "read-request",
            TransportEvent::WriteRequest { .. } => "write-request",
            TransportEvent::NotifyRequest { .. } => "notify-request",
        }
    }
}
