//! Hardware address of the local controller
//!
//! The controller reports its address least-significant byte first. Everything
//! above the HCI layer (display, manufacturer data, the address-read
//! characteristic) uses the canonical most-significant-first order held by
//! [`HardwareAddress`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::errors::AddressParseError;

/// Length of a BLE device address in bytes
pub const ADDRESS_LEN: usize = 6;

// ----------------------------------------------------------------------------
// Hardware Address
// ----------------------------------------------------------------------------

/// Six-byte device address in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HardwareAddress([u8; ADDRESS_LEN]);

impl HardwareAddress {
    /// The all-zero address published when resolution fails
    pub const ZERO: Self = Self([0; ADDRESS_LEN]);

    /// Create an address from canonical-order bytes
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an address from the controller's wire order (reversed)
    pub fn from_transport_order(raw: [u8; ADDRESS_LEN]) -> Self {
        let mut bytes = raw;
        bytes.reverse();
        Self(bytes)
    }

    /// Bytes in the controller's wire order
    pub fn to_transport_order(self) -> [u8; ADDRESS_LEN] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Canonical-order bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ADDRESS_LEN]
    }
}

impl From<[u8; ADDRESS_LEN]> for HardwareAddress {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != ADDRESS_LEN {
            return Err(AddressParseError(s.to_string()));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            let decoded = hex::decode(part).map_err(|_| AddressParseError(s.to_string()))?;
            match decoded.as_slice() {
                [byte] => *slot = *byte,
                _ => return Err(AddressParseError(s.to_string())),
            }
        }
        Ok(Self(bytes))
    }
}

// ----------------------------------------------------------------------------
// Published Address
// ----------------------------------------------------------------------------

/// How the published address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSource {
    /// Read back from the controller
    Resolved,
    /// Resolution failed; the zero address stands in
    Fallback,
}

/// Address value together with its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedAddress {
    pub address: HardwareAddress,
    pub source: AddressSource,
}

impl PublishedAddress {
    pub fn resolved(address: HardwareAddress) -> Self {
        Self {
            address,
            source: AddressSource::Resolved,
        }
    }

    pub fn fallback() -> Self {
        Self {
            address: HardwareAddress::ZERO,
            source: AddressSource::Fallback,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.source == AddressSource::Resolved
    }
}

/// Write-once holder for the process-wide address.
///
/// Published before any characteristic is registered; readers only ever see
/// the final value.
#[derive(Debug, Default)]
pub struct AddressCell {
    inner: OnceLock<PublishedAddress>,
}

impl AddressCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the address. Returns the rejected value if already published.
    pub fn publish(&self, value: PublishedAddress) -> Result<(), PublishedAddress> {
        self.inner.set(value)
    }

    pub fn get(&self) -> Option<&PublishedAddress> {
        self.inner.get()
    }
}
