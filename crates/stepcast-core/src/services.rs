//! The WeChat pedometer service
//!
//! Service `0xFEE7` carries three characteristics:
//!
//! | UUID     | Capabilities         | Value                      |
//! |----------|----------------------|----------------------------|
//! | `0xFEA1` | read, notify         | current step record        |
//! | `0xFEA2` | read, write, notify  | target step record         |
//! | `0xFEC9` | read                 | hardware address           |
//!
//! `0xFEC7` and `0xFEC8` belong to the same profile but are not served.

use std::sync::Arc;

use tracing::{info, warn};

use crate::address::HardwareAddress;
use crate::advertising::{AdFlags, AdvertisementBuilder, AdvertisementPacket};
use crate::config::DeviceConfig;
use crate::errors::AdvertisementError;
use crate::gatt::{
    AttStatus, Characteristic, NotifyHandler, ReadHandler, ReadRequest, Uuid16, WriteHandler,
    WriteRequest,
};
use crate::peers::PeerId;
use crate::step_record::{self, StepCount, StepRecord};

pub const PEDOMETER_SERVICE_UUID: Uuid16 = Uuid16::new(0xFEE7);
pub const PEDOMETER_UUID: Uuid16 = Uuid16::new(0xFEA1);
pub const TARGET_UUID: Uuid16 = Uuid16::new(0xFEA2);
pub const RESERVED_WRITE_UUID: Uuid16 = Uuid16::new(0xFEC7);
pub const RESERVED_INDICATE_UUID: Uuid16 = Uuid16::new(0xFEC8);
pub const ADDRESS_READ_UUID: Uuid16 = Uuid16::new(0xFEC9);

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

/// Serves a fixed step record on read and notify
pub struct StepRecordHandler {
    record: StepRecord,
}

impl StepRecordHandler {
    pub fn new(count: StepCount) -> Self {
        Self {
            record: step_record::encode(count),
        }
    }
}

impl ReadHandler for StepRecordHandler {
    fn read(&self, request: &ReadRequest) -> Vec<u8> {
        info!("Step record read by {}", request.peer);
        self.record.to_vec()
    }
}

impl NotifyHandler for StepRecordHandler {
    fn payload(&self, peer: &PeerId) -> Vec<u8> {
        info!("Step record notify for {}", peer);
        self.record.to_vec()
    }
}

/// Accepts writes to the target characteristic.
///
/// Writes are logged and acknowledged. In strict mode the payload must also be
/// a valid step record within `max_steps`.
pub struct TargetWriteHandler {
    strict: bool,
    max_steps: u32,
}

impl TargetWriteHandler {
    pub fn new(strict: bool, max_steps: u32) -> Self {
        Self { strict, max_steps }
    }
}

impl WriteHandler for TargetWriteHandler {
    fn write(&self, request: &WriteRequest) -> AttStatus {
        info!(
            "Target write from {}: {}",
            request.peer,
            hex::encode(&request.data)
        );

        if !self.strict {
            return AttStatus::Success;
        }

        match step_record::decode_slice(&request.data, self.max_steps) {
            Ok(count) => {
                info!("Target step count from {}: {}", request.peer, count);
                AttStatus::Success
            }
            Err(e) => {
                warn!("Rejected target write from {}: {}", request.peer, e);
                AttStatus::InvalidPayload
            }
        }
    }
}

/// Serves the published hardware address
pub struct AddressReadHandler {
    address: HardwareAddress,
}

impl AddressReadHandler {
    pub fn new(address: HardwareAddress) -> Self {
        Self { address }
    }
}

impl ReadHandler for AddressReadHandler {
    fn read(&self, request: &ReadRequest) -> Vec<u8> {
        info!("Address read by {}", request.peer);
        self.address.as_bytes().to_vec()
    }
}

// ----------------------------------------------------------------------------
// Service Definition
// ----------------------------------------------------------------------------

/// Build the pedometer characteristics bound to `steps` and `address`
pub fn pedometer_characteristics(
    config: &DeviceConfig,
    steps: StepCount,
    address: HardwareAddress,
) -> Vec<Characteristic> {
    let record = Arc::new(StepRecordHandler::new(steps));

    vec![
        Characteristic::builder(PEDOMETER_UUID)
            .with_read(record.clone())
            .with_notify(record.clone())
            .build(),
        Characteristic::builder(TARGET_UUID)
            .with_read(record.clone())
            .with_write(Arc::new(TargetWriteHandler::new(
                config.strict_target_writes,
                config.max_steps,
            )))
            .with_notify(record)
            .build(),
        Characteristic::builder(ADDRESS_READ_UUID)
            .with_read(Arc::new(AddressReadHandler::new(address)))
            .build(),
    ]
}

/// Advertising payload: flags, service UUID, name, then the address as
/// manufacturer data
pub fn pedometer_advertisement(
    config: &DeviceConfig,
    address: HardwareAddress,
) -> Result<AdvertisementPacket, AdvertisementError> {
    let mut builder = AdvertisementBuilder::new();
    builder
        .flags(AdFlags::GENERAL_DISCOVERABLE | AdFlags::LE_ONLY)?
        .service_uuids(&[PEDOMETER_SERVICE_UUID])?
        .local_name(&config.device_name)?
        .manufacturer_data(config.company_id, address.as_bytes())?;
    Ok(builder.build())
}
