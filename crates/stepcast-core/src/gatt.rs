//! GATT characteristic model and dispatch
//!
//! Characteristics are defined by a 16-bit UUID plus the handler objects
//! attached to them. The capability set (read, write, notify) is derived from
//! which handlers are present, so a characteristic can never advertise a
//! capability it cannot serve.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::GattError;
use crate::peers::PeerId;

// ----------------------------------------------------------------------------
// UUIDs
// ----------------------------------------------------------------------------

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// 16-bit assigned UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uuid16(u16);

impl Uuid16 {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// Expand to the full 128-bit form using the Bluetooth base UUID
    pub fn to_uuid(self) -> uuid::Uuid {
        uuid::Uuid::from_u128(BLUETOOTH_BASE_UUID | ((self.0 as u128) << 96))
    }

    /// Shorten a 128-bit UUID built on the Bluetooth base UUID
    pub fn from_uuid(uuid: &uuid::Uuid) -> Option<Self> {
        let value = uuid.as_u128();
        let short = ((value >> 96) & 0xFFFF) as u16;
        if value == Self(short).to_uuid().as_u128() {
            Some(Self(short))
        } else {
            None
        }
    }
}

impl fmt::Display for Uuid16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for Uuid16 {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// ATT Status
// ----------------------------------------------------------------------------

/// Result codes returned to a central for reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttStatus {
    Success = 0x00,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    AttributeNotFound = 0x0A,
    InvalidPayload = 0x13,
}

impl AttStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == AttStatus::Success
    }
}

impl fmt::Display for AttStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, self.code())
    }
}

// ----------------------------------------------------------------------------
// Requests and Handlers
// ----------------------------------------------------------------------------

/// Read request from a central
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub peer: PeerId,
    pub offset: u16,
}

impl ReadRequest {
    pub fn new(peer: PeerId) -> Self {
        Self { peer, offset: 0 }
    }
}

/// Write request from a central
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub peer: PeerId,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl WriteRequest {
    pub fn new(peer: PeerId, data: Vec<u8>) -> Self {
        Self {
            peer,
            offset: 0,
            data,
        }
    }
}

/// Produces the current value of a readable characteristic.
///
/// Must not block and must not have side effects beyond logging.
pub trait ReadHandler: Send + Sync {
    fn read(&self, request: &ReadRequest) -> Vec<u8>;
}

/// Accepts writes to a writable characteristic
pub trait WriteHandler: Send + Sync {
    fn write(&self, request: &WriteRequest) -> AttStatus;
}

/// Produces the value pushed to a subscribed peer
pub trait NotifyHandler: Send + Sync {
    fn payload(&self, peer: &PeerId) -> Vec<u8>;
}

// ----------------------------------------------------------------------------
// Characteristics
// ----------------------------------------------------------------------------

/// Capability set of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// A characteristic and its handler objects
#[derive(Clone)]
pub struct Characteristic {
    uuid: Uuid16,
    read: Option<Arc<dyn ReadHandler>>,
    write: Option<Arc<dyn WriteHandler>>,
    notify: Option<Arc<dyn NotifyHandler>>,
}

impl Characteristic {
    pub fn builder(uuid: Uuid16) -> CharacteristicBuilder {
        CharacteristicBuilder {
            inner: Characteristic {
                uuid,
                read: None,
                write: None,
                notify: None,
            },
        }
    }

    pub fn uuid(&self) -> Uuid16 {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        CharacteristicProperties {
            read: self.read.is_some(),
            write: self.write.is_some(),
            notify: self.notify.is_some(),
        }
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("properties", &self.properties())
            .finish()
    }
}

/// Attaches handlers to a characteristic
pub struct CharacteristicBuilder {
    inner: Characteristic,
}

impl CharacteristicBuilder {
    pub fn with_read(mut self, handler: Arc<dyn ReadHandler>) -> Self {
        self.inner.read = Some(handler);
        self
    }

    pub fn with_write(mut self, handler: Arc<dyn WriteHandler>) -> Self {
        self.inner.write = Some(handler);
        self
    }

    pub fn with_notify(mut self, handler: Arc<dyn NotifyHandler>) -> Self {
        self.inner.notify = Some(handler);
        self
    }

    pub fn build(self) -> Characteristic {
        self.inner
    }
}

// ----------------------------------------------------------------------------
// Service Descriptors
// ----------------------------------------------------------------------------

/// Backend-facing description of a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid16,
    pub properties: CharacteristicProperties,
}

/// Backend-facing description of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub uuid: Uuid16,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn characteristic(&self, uuid: Uuid16) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Handle to the live service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    descriptor: ServiceDescriptor,
}

impl ServiceHandle {
    pub fn uuid(&self) -> Uuid16 {
        self.descriptor.uuid
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

#[derive(Debug)]
struct LiveService {
    handle: ServiceHandle,
    characteristics: Vec<Characteristic>,
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Holds the single live service and routes requests to its handlers
#[derive(Debug, Default)]
pub struct CharacteristicRegistry {
    live: Option<LiveService>,
}

impl CharacteristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the service. Fails if a service is already live.
    pub fn register_service(
        &mut self,
        uuid: Uuid16,
        characteristics: Vec<Characteristic>,
    ) -> Result<ServiceHandle, GattError> {
        if let Some(live) = &self.live {
            return Err(GattError::ServiceAlreadyRegistered(live.handle.uuid()));
        }

        let mut seen = HashSet::new();
        for characteristic in &characteristics {
            if !seen.insert(characteristic.uuid) {
                return Err(GattError::DuplicateCharacteristic(characteristic.uuid));
            }
        }

        let handle = ServiceHandle {
            descriptor: ServiceDescriptor {
                uuid,
                characteristics: characteristics
                    .iter()
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        properties: c.properties(),
                    })
                    .collect(),
            },
        };

        info!(
            "Registered service {} with {} characteristics",
            uuid,
            characteristics.len()
        );
        self.live = Some(LiveService {
            handle: handle.clone(),
            characteristics,
        });
        Ok(handle)
    }

    /// Drop the live service. Returns its handle if one was registered.
    pub fn clear(&mut self) -> Option<ServiceHandle> {
        let live = self.live.take()?;
        info!("Removed service {}", live.handle.uuid());
        Some(live.handle)
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn service(&self) -> Option<&ServiceHandle> {
        self.live.as_ref().map(|l| &l.handle)
    }

    pub fn characteristic(&self, uuid: Uuid16) -> Option<&Characteristic> {
        self.live
            .as_ref()?
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
    }

    /// Serve a read, honouring the request offset
    pub fn read(&self, uuid: Uuid16, request: &ReadRequest) -> Result<Vec<u8>, AttStatus> {
        let characteristic = self.characteristic(uuid).ok_or(AttStatus::AttributeNotFound)?;
        let handler = characteristic
            .read
            .as_ref()
            .ok_or(AttStatus::ReadNotPermitted)?;

        let value = handler.read(request);
        let offset = request.offset as usize;
        if offset > value.len() {
            return Err(AttStatus::InvalidOffset);
        }
        debug!(
            "Read {} by {}: {}",
            uuid,
            request.peer,
            hex::encode(&value[offset..])
        );
        Ok(value[offset..].to_vec())
    }

    pub fn write(&self, uuid: Uuid16, request: &WriteRequest) -> AttStatus {
        let Some(characteristic) = self.characteristic(uuid) else {
            return AttStatus::AttributeNotFound;
        };
        match &characteristic.write {
            Some(handler) => handler.write(request),
            None => AttStatus::WriteNotPermitted,
        }
    }

    /// Value to push to `peer` for a notify on `uuid`
    pub fn notify_payload(&self, uuid: Uuid16, peer: &PeerId) -> Result<Vec<u8>, AttStatus> {
        let characteristic = self.characteristic(uuid).ok_or(AttStatus::AttributeNotFound)?;
        let handler = characteristic
            .notify
            .as_ref()
            .ok_or(AttStatus::RequestNotSupported)?;
        Ok(handler.payload(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<u8>);

    impl ReadHandler for Fixed {
        fn read(&self, _request: &ReadRequest) -> Vec<u8> {
            self.0.clone()
        }
    }

    impl NotifyHandler for Fixed {
        fn payload(&self, _peer: &PeerId) -> Vec<u8> {
            self.0.clone()
        }
    }

    struct Reject;

    impl WriteHandler for Reject {
        fn write(&self, _request: &WriteRequest) -> AttStatus {
            AttStatus::InvalidPayload
        }
    }

    fn peer() -> PeerId {
        PeerId::new("central-1")
    }

    fn sample_characteristics() -> Vec<Characteristic> {
        let value = Arc::new(Fixed(vec![1, 2, 3, 4]));
        vec![
            Characteristic::builder(Uuid16::new(0x0001))
                .with_read(value.clone())
                .with_notify(value)
                .build(),
            Characteristic::builder(Uuid16::new(0x0002))
                .with_write(Arc::new(Reject))
                .build(),
        ]
    }

    #[test]
    fn test_uuid16_expansion() {
        let uuid = Uuid16::new(0xFEE7).to_uuid();
        assert_eq!(uuid.to_string(), "0000fee7-0000-1000-8000-00805f9b34fb");
        assert_eq!(Uuid16::from_uuid(&uuid), Some(Uuid16::new(0xFEE7)));
        assert_eq!(Uuid16::from_uuid(&uuid::Uuid::nil()), None);
        assert_eq!(Uuid16::new(0xFEA1).to_string(), "0xFEA1");
    }

    #[test]
    fn test_properties_follow_handlers() {
        let chars = sample_characteristics();
        assert_eq!(
            chars[0].properties(),
            CharacteristicProperties {
                read: true,
                write: false,
                notify: true
            }
        );
        assert_eq!(
            chars[1].properties(),
            CharacteristicProperties {
                read: false,
                write: true,
                notify: false
            }
        );
    }

    #[test]
    fn test_single_live_service() {
        let mut registry = CharacteristicRegistry::new();
        let handle = registry
            .register_service(Uuid16::new(0xFEE7), sample_characteristics())
            .unwrap();
        assert_eq!(handle.descriptor().characteristics.len(), 2);

        assert_eq!(
            registry.register_service(Uuid16::new(0xFEE7), sample_characteristics()),
            Err(GattError::ServiceAlreadyRegistered(Uuid16::new(0xFEE7)))
        );

        assert_eq!(registry.clear(), Some(handle));
        assert!(!registry.is_live());
        assert!(registry
            .register_service(Uuid16::new(0xFEE7), sample_characteristics())
            .is_ok());
    }

    #[test]
    fn test_duplicate_characteristic_rejected() {
        let mut registry = CharacteristicRegistry::new();
        let mut chars = sample_characteristics();
        chars.push(chars[0].clone());
        assert_eq!(
            registry.register_service(Uuid16::new(0xFEE7), chars),
            Err(GattError::DuplicateCharacteristic(Uuid16::new(0x0001)))
        );
        assert!(!registry.is_live());
    }

    #[test]
    fn test_dispatch() {
        let mut registry = CharacteristicRegistry::new();
        assert_eq!(
            registry.read(Uuid16::new(0x0001), &ReadRequest::new(peer())),
            Err(AttStatus::AttributeNotFound)
        );

        registry
            .register_service(Uuid16::new(0xFEE7), sample_characteristics())
            .unwrap();

        assert_eq!(
            registry.read(Uuid16::new(0x0001), &ReadRequest::new(peer())),
            Ok(vec![1, 2, 3, 4])
        );
        let offset_read = ReadRequest {
            peer: peer(),
            offset: 3,
        };
        assert_eq!(registry.read(Uuid16::new(0x0001), &offset_read), Ok(vec![4]));
        let past_end = ReadRequest {
            peer: peer(),
            offset: 5,
        };
        assert_eq!(
            registry.read(Uuid16::new(0x0001), &past_end),
            Err(AttStatus::InvalidOffset)
        );

        assert_eq!(
            registry.read(Uuid16::new(0x0002), &ReadRequest::new(peer())),
            Err(AttStatus::ReadNotPermitted)
        );
        assert_eq!(
            registry.write(Uuid16::new(0x0001), &WriteRequest::new(peer(), vec![0])),
            AttStatus::WriteNotPermitted
        );
        assert_eq!(
            registry.write(Uuid16::new(0x0002), &WriteRequest::new(peer(), vec![0])),
            AttStatus::InvalidPayload
        );
        assert_eq!(
            registry.notify_payload(Uuid16::new(0x0001), &peer()),
            Ok(vec![1, 2, 3, 4])
        );
        assert_eq!(
            registry.notify_payload(Uuid16::new(0x0002), &peer()),
            Err(AttStatus::RequestNotSupported)
        );
        assert_eq!(
            registry.notify_payload(Uuid16::new(0x0003), &peer()),
            Err(AttStatus::AttributeNotFound)
        );
    }
}
