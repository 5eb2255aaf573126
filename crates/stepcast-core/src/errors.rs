//! Error types for the stepcast core

use thiserror::Error;

use crate::gatt::{AttStatus, Uuid16};
use crate::peers::PeerId;

// ----------------------------------------------------------------------------
// HCI Errors
// ----------------------------------------------------------------------------

/// Failures of the raw controller command path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Controller returned non-success status 0x{0:02x}")]
    NonSuccessStatus(u8),

    #[error("HCI transport error: {0}")]
    TransportError(String),

    #[error("HCI command timed out after {ms} ms")]
    Timeout { ms: u64 },
}

// ----------------------------------------------------------------------------
// Encoding Errors
// ----------------------------------------------------------------------------

/// Step record encoding and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Bad step record tag: 0x{0:02x}")]
    BadTag(u8),

    #[error("Bad step record length: {0} bytes (expected 4)")]
    BadLength(usize),

    #[error("Step count {value} out of range (max: {max})")]
    OutOfRange { value: u32, max: u32 },
}

/// Advertising payload construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementError {
    #[error("Advertising field too large: needs {needed} bytes, {available} available")]
    TooLarge { needed: usize, available: usize },

    #[error("Service UUID list is empty")]
    EmptyUuidList,

    #[error("Malformed advertising payload at offset {offset}")]
    Malformed { offset: usize },
}

/// Address text parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid hardware address: {0}")]
pub struct AddressParseError(pub String);

// ----------------------------------------------------------------------------
// GATT and Transport Errors
// ----------------------------------------------------------------------------

/// Characteristic registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Service {0} is already registered")]
    ServiceAlreadyRegistered(Uuid16),

    #[error("Duplicate characteristic {0}")]
    DuplicateCharacteristic(Uuid16),
}

/// Errors reported by a peripheral backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to register service: {0}")]
    ServiceRegistration(String),

    #[error("Advertising failed: {0}")]
    Advertising(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Transport closed")]
    Closed,
}

/// Failure to open the BLE device. Always fatal for the process.
#[derive(Error, Debug)]
pub enum DeviceOpenError {
    #[error("Failed to open BlueZ session: {0}")]
    Session(String),

    #[error("BLE adapter not available: {0}")]
    Adapter(String),

    #[error("Failed to open HCI socket: {0}")]
    HciSocket(String),

    #[error("BLE peripheral mode is not supported on this platform: {0}")]
    Unsupported(String),
}

/// Notification delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Peer not connected: {0}")]
    PeerNotConnected(PeerId),

    #[error("Notify on {characteristic} refused: {status}")]
    Refused {
        characteristic: Uuid16,
        status: AttStatus,
    },

    #[error("Notify delivery failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Notification dispatcher closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Device configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Step count {value} out of range [0, {max}]")]
    StepsOutOfRange { value: u32, max: u32 },

    #[error("Step bound {max} exceeds the 24-bit record limit {limit}")]
    InvalidBound { max: u32, limit: u32 },

    #[error("Device name must not be empty")]
    EmptyName,

    #[error("Device name too long: {len} bytes (max: {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("Address resolution timeout must be non-zero")]
    ZeroTimeout,

    #[error("Address resolution timeout {ms} ms exceeds the maximum of {max} ms")]
    TimeoutTooLong { ms: u64, max: u64 },
}

// ----------------------------------------------------------------------------
// Umbrella Error
// ----------------------------------------------------------------------------

/// Any error produced by the stepcast core
#[derive(Error, Debug)]
pub enum StepcastError {
    #[error(transparent)]
    Hci(#[from] HciError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Advertisement(#[from] AdvertisementError),

    #[error(transparent)]
    Gatt(#[from] GattError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    DeviceOpen(#[from] DeviceOpenError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for stepcast core operations
pub type Result<T> = std::result::Result<T, StepcastError>;
