//! Controller address query
//!
//! The local address is read with the informational command `0x1009`
//! (`Read_BD_ADDR`), which takes no parameters and returns a status byte
//! followed by the six address bytes, least significant first. Opcodes and the
//! address parameter come from `bt-hci`.

use std::sync::Arc;
use std::time::Duration;

use bt_hci::cmd::info::ReadBdAddr;
use bt_hci::cmd::Cmd;
use bt_hci::param::BdAddr;
use bt_hci::FromHciBytes;
use tracing::{debug, info};

use crate::address::{HardwareAddress, ADDRESS_LEN};
use crate::errors::HciError;
use crate::transport::HciTransport;

pub use bt_hci::cmd::{Opcode, OpcodeGroup};

/// Opcode of the address query (OGF 0x04, OCF 0x009)
pub const READ_ADDRESS_OPCODE: Opcode = <ReadBdAddr as Cmd>::OPCODE;

/// Status byte plus six address bytes
pub const READ_ADDRESS_RESPONSE_LEN: usize = 1 + ADDRESS_LEN;

// ----------------------------------------------------------------------------
// Raw Commands
// ----------------------------------------------------------------------------

/// A raw controller command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub opcode: Opcode,
    pub params: Vec<u8>,
}

impl RawCommand {
    pub fn new(opcode: Opcode, params: Vec<u8>) -> Self {
        Self { opcode, params }
    }

    pub fn read_address() -> Self {
        Self::new(READ_ADDRESS_OPCODE, Vec::new())
    }
}

// ----------------------------------------------------------------------------
// Address Resolver
// ----------------------------------------------------------------------------

/// Reads the controller's own address
#[derive(Clone)]
pub struct AddressResolver {
    transport: Arc<dyn HciTransport>,
    timeout: Duration,
}

impl AddressResolver {
    pub fn new(transport: Arc<dyn HciTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Query the controller. Bounded by the configured timeout.
    pub async fn resolve(&self) -> Result<HardwareAddress, HciError> {
        let command = RawCommand::read_address();
        debug!(
            "Sending HCI command 0x{:04x} (ocf 0x{:03x})",
            command.opcode.to_raw(),
            command.opcode.cmd()
        );

        let response = tokio::time::timeout(self.timeout, self.transport.send_raw_command(command))
            .await
            .map_err(|_| HciError::Timeout {
                ms: self.timeout.as_millis() as u64,
            })??;

        let address = parse_address_response(&response)?;
        info!("Controller address resolved: {}", address);
        Ok(address)
    }
}

/// Parse the return parameters of the address query
pub fn parse_address_response(response: &[u8]) -> Result<HardwareAddress, HciError> {
    let (&status, rest) = response
        .split_first()
        .ok_or_else(|| HciError::TransportError("empty command response".to_string()))?;

    if status != 0x00 {
        return Err(HciError::NonSuccessStatus(status));
    }

    let short = || {
        HciError::TransportError(format!(
            "short command response: {} bytes (expected {})",
            response.len(),
            READ_ADDRESS_RESPONSE_LEN
        ))
    };
    let (bd_addr, _) = BdAddr::from_hci_bytes(rest).map_err(|_| short())?;
    let raw: [u8; ADDRESS_LEN] = bd_addr.raw().try_into().map_err(|_| short())?;

    Ok(HardwareAddress::from_transport_order(raw))
}
