//! Stepcast core
//!
//! Protocol core for a BLE peripheral that presents itself as a WeChat-style
//! pedometer. The crate owns the device lifecycle state machine, the
//! characteristic dispatch model and the binary encodings (step records,
//! advertising payloads, the address query). Everything that touches a radio
//! sits behind the traits in [`transport`], so the core runs unchanged against
//! BlueZ or the virtual controller used in tests.

pub mod address;
pub mod advertising;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod gatt;
pub mod hci;
pub mod peers;
pub mod services;
pub mod step_record;
pub mod transport;

pub use address::{AddressCell, AddressSource, HardwareAddress, PublishedAddress};
pub use advertising::{AdFlags, AdvertisementBuilder, AdvertisementPacket, MAX_ADVERTISEMENT_LEN};
pub use config::DeviceConfig;
pub use controller::{ControllerState, DeviceController};
pub use dispatcher::{NotificationDispatcher, NotifyJob, NotifyTicket};
pub use errors::{
    AdvertisementError, CodecError, ConfigError, DeviceOpenError, DispatchError, GattError,
    HciError, Result, StepcastError, TransportError,
};
pub use gatt::{
    AttStatus, Characteristic, CharacteristicProperties, CharacteristicRegistry, ReadRequest,
    ServiceDescriptor, ServiceHandle, Uuid16, WriteRequest,
};
pub use hci::{AddressResolver, Opcode, OpcodeGroup, RawCommand, READ_ADDRESS_OPCODE};
pub use peers::{ConnHandle, ConnectedPeers, PeerId};
pub use step_record::{StepCount, StepRecord};
pub use transport::{DeviceState, HciTransport, Notifier, PeripheralTransport, TransportEvent};
