//! Advertising payload construction
//!
//! Builds the legacy advertising PDU payload as a sequence of
//! `[length][type][data...]` fields capped at 31 bytes. Fields are appended in
//! call order. When a field does not fit, the builder follows a fixed policy:
//!
//! - flags and manufacturer data are rejected with
//!   [`AdvertisementError::TooLarge`] and the payload is left untouched;
//! - service UUID lists keep as many UUIDs as fit and switch to the
//!   "incomplete list" field type;
//! - the local name is cut at a character boundary and emitted as a
//!   "shortened local name".

use std::ops::{BitOr, BitOrAssign};

use smallvec::SmallVec;
use tracing::debug;

use crate::errors::AdvertisementError;
use crate::gatt::Uuid16;

/// Maximum legacy advertising payload length
pub const MAX_ADVERTISEMENT_LEN: usize = 31;

/// Length byte plus type byte
const FIELD_HEADER_LEN: usize = 2;

/// Advertising data field types
pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_UUID16: u8 = 0x02;
    pub const COMPLETE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_UUID128: u8 = 0x06;
    pub const COMPLETE_UUID128: u8 = 0x07;
    pub const SHORT_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

// ----------------------------------------------------------------------------
// Flags
// ----------------------------------------------------------------------------

/// Advertising flags field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdFlags(u8);

impl AdFlags {
    pub const LIMITED_DISCOVERABLE: Self = Self(0x01);
    pub const GENERAL_DISCOVERABLE: Self = Self(0x02);
    pub const LE_ONLY: Self = Self(0x04);
    pub const BOTH_CONTROLLER: Self = Self(0x08);
    pub const BOTH_HOST: Self = Self(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for AdFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AdFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Incrementally assembles an advertising payload
#[derive(Debug, Clone, Default)]
pub struct AdvertisementBuilder {
    buf: SmallVec<[u8; MAX_ADVERTISEMENT_LEN]>,
}

impl AdvertisementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes still available in the payload
    pub fn remaining(&self) -> usize {
        MAX_ADVERTISEMENT_LEN - self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append the flags field
    pub fn flags(&mut self, flags: AdFlags) -> Result<&mut Self, AdvertisementError> {
        self.append_exact(ad_type::FLAGS, &[flags.bits()])?;
        Ok(self)
    }

    /// Append a list of 16-bit service UUIDs in their compact form
    pub fn service_uuids(&mut self, uuids: &[Uuid16]) -> Result<&mut Self, AdvertisementError> {
        let encoded: Vec<[u8; 2]> = uuids.iter().map(|u| u.value().to_le_bytes()).collect();
        self.append_uuid_list(
            ad_type::COMPLETE_UUID16,
            ad_type::INCOMPLETE_UUID16,
            &encoded,
        )?;
        Ok(self)
    }

    /// Append a list of full 128-bit service UUIDs
    pub fn service_uuids_128(
        &mut self,
        uuids: &[uuid::Uuid],
    ) -> Result<&mut Self, AdvertisementError> {
        let encoded: Vec<[u8; 16]> = uuids
            .iter()
            .map(|u| {
                let mut bytes = *u.as_bytes();
                bytes.reverse();
                bytes
            })
            .collect();
        self.append_uuid_list(
            ad_type::COMPLETE_UUID128,
            ad_type::INCOMPLETE_UUID128,
            &encoded,
        )?;
        Ok(self)
    }

    /// Append the local name, shortening it if it does not fit
    pub fn local_name(&mut self, name: &str) -> Result<&mut Self, AdvertisementError> {
        let available = self.remaining();
        if FIELD_HEADER_LEN + name.len() <= available {
            self.push_field(ad_type::COMPLETE_LOCAL_NAME, name.as_bytes());
            return Ok(self);
        }

        let budget = available.saturating_sub(FIELD_HEADER_LEN);
        let mut cut = budget.min(name.len());
        while cut > 0 && !name.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            return Err(AdvertisementError::TooLarge {
                needed: FIELD_HEADER_LEN + name.len(),
                available,
            });
        }

        debug!("Shortening advertised name to {} of {} bytes", cut, name.len());
        self.push_field(ad_type::SHORT_LOCAL_NAME, &name.as_bytes()[..cut]);
        Ok(self)
    }

    /// Append manufacturer data: company ID (little-endian) followed by `data`
    pub fn manufacturer_data(
        &mut self,
        company_id: u16,
        data: &[u8],
    ) -> Result<&mut Self, AdvertisementError> {
        let mut payload: SmallVec<[u8; MAX_ADVERTISEMENT_LEN]> = SmallVec::new();
        payload.extend_from_slice(&company_id.to_le_bytes());
        payload.extend_from_slice(data);
        self.append_exact(ad_type::MANUFACTURER_DATA, &payload)?;
        Ok(self)
    }

    /// Finish the payload. Does not start advertising.
    pub fn build(&self) -> AdvertisementPacket {
        AdvertisementPacket {
            bytes: self.buf.clone(),
        }
    }

    fn append_exact(&mut self, ty: u8, data: &[u8]) -> Result<(), AdvertisementError> {
        let needed = FIELD_HEADER_LEN + data.len();
        let available = self.remaining();
        if needed > available {
            return Err(AdvertisementError::TooLarge { needed, available });
        }
        self.push_field(ty, data);
        Ok(())
    }

    fn append_uuid_list<const N: usize>(
        &mut self,
        complete: u8,
        incomplete: u8,
        uuids: &[[u8; N]],
    ) -> Result<(), AdvertisementError> {
        if uuids.is_empty() {
            return Err(AdvertisementError::EmptyUuidList);
        }

        let available = self.remaining();
        let fit = available.saturating_sub(FIELD_HEADER_LEN) / N;
        if fit == 0 {
            return Err(AdvertisementError::TooLarge {
                needed: FIELD_HEADER_LEN + N,
                available,
            });
        }

        let count = fit.min(uuids.len());
        let ty = if count == uuids.len() {
            complete
        } else {
            debug!(
                "Advertising {} of {} service UUIDs (incomplete list)",
                count,
                uuids.len()
            );
            incomplete
        };

        let data: Vec<u8> = uuids[..count].iter().flatten().copied().collect();
        self.push_field(ty, &data);
        Ok(())
    }

    fn push_field(&mut self, ty: u8, data: &[u8]) {
        self.buf.push((data.len() + 1) as u8);
        self.buf.push(ty);
        self.buf.extend_from_slice(data);
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// A single advertising field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdField {
    pub ad_type: u8,
    pub data: Vec<u8>,
}

/// Finished advertising payload, at most 31 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementPacket {
    bytes: SmallVec<[u8; MAX_ADVERTISEMENT_LEN]>,
}

impl AdvertisementPacket {
    /// Wrap raw payload bytes, validating the length bound and field layout
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdvertisementError> {
        if bytes.len() > MAX_ADVERTISEMENT_LEN {
            return Err(AdvertisementError::TooLarge {
                needed: bytes.len(),
                available: MAX_ADVERTISEMENT_LEN,
            });
        }
        let packet = Self {
            bytes: SmallVec::from_slice(bytes),
        };
        packet.fields()?;
        Ok(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Parse the payload back into its fields
    pub fn fields(&self) -> Result<Vec<AdField>, AdvertisementError> {
        let mut fields = Vec::new();
        let mut offset = 0;
        while offset < self.bytes.len() {
            let len = self.bytes[offset] as usize;
            if len == 0 {
                // Zero-length field marks early termination
                break;
            }
            let end = offset + 1 + len;
            if end > self.bytes.len() {
                return Err(AdvertisementError::Malformed { offset });
            }
            fields.push(AdField {
                ad_type: self.bytes[offset + 1],
                data: self.bytes[offset + 2..end].to_vec(),
            });
            offset = end;
        }
        Ok(fields)
    }

    fn field(&self, types: &[u8]) -> Option<AdField> {
        self.fields()
            .ok()?
            .into_iter()
            .find(|f| types.contains(&f.ad_type))
    }

    pub fn flags(&self) -> Option<AdFlags> {
        self.field(&[ad_type::FLAGS])
            .and_then(|f| f.data.first().copied())
            .map(AdFlags::from_bits)
    }

    /// Local name, complete or shortened
    pub fn local_name(&self) -> Option<String> {
        self.field(&[ad_type::COMPLETE_LOCAL_NAME, ad_type::SHORT_LOCAL_NAME])
            .map(|f| String::from_utf8_lossy(&f.data).into_owned())
    }

    pub fn service_uuids(&self) -> Vec<Uuid16> {
        self.field(&[ad_type::COMPLETE_UUID16, ad_type::INCOMPLETE_UUID16])
            .map(|f| {
                f.data
                    .chunks_exact(2)
                    .map(|c| Uuid16::new(u16::from_le_bytes([c[0], c[1]])))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn service_uuids_128(&self) -> Vec<uuid::Uuid> {
        self.field(&[ad_type::COMPLETE_UUID128, ad_type::INCOMPLETE_UUID128])
            .map(|f| {
                f.data
                    .chunks_exact(16)
                    .filter_map(|c| <[u8; 16]>::try_from(c).ok())
                    .map(|mut bytes| {
                        bytes.reverse();
                        uuid::Uuid::from_bytes(bytes)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Company ID and payload of the manufacturer data field
    pub fn manufacturer_data(&self) -> Option<(u16, Vec<u8>)> {
        let field = self.field(&[ad_type::MANUFACTURER_DATA])?;
        if field.data.len() < 2 {
            return None;
        }
        let company = u16::from_le_bytes([field.data[0], field.data[1]]);
        Some((company, field.data[2..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WECHAT_SERVICE: Uuid16 = Uuid16::new(0xFEE7);

    #[test]
    fn test_device_advertisement_layout() {
        let mut builder = AdvertisementBuilder::new();
        builder
            .flags(AdFlags::GENERAL_DISCOVERABLE | AdFlags::LE_ONLY)
            .unwrap()
            .service_uuids(&[WECHAT_SERVICE])
            .unwrap()
            .local_name("WeixinBLE")
            .unwrap()
            .manufacturer_data(0x2333, &[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA])
            .unwrap();
        let packet = builder.build();

        let mut expected = vec![0x02, 0x01, 0x06, 0x03, 0x03, 0xE7, 0xFE, 0x0A, 0x09];
        expected.extend_from_slice(b"WeixinBLE");
        expected.extend_from_slice(&[0x09, 0xFF, 0x33, 0x23, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(packet.as_bytes(), expected.as_slice());
        assert_eq!(packet.len(), 28);

        assert_eq!(packet.flags().map(AdFlags::bits), Some(0x06));
        assert_eq!(packet.service_uuids(), vec![WECHAT_SERVICE]);
        assert_eq!(packet.local_name().as_deref(), Some("WeixinBLE"));
        assert_eq!(
            packet.manufacturer_data(),
            Some((0x2333, vec![0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]))
        );
    }

    #[test]
    fn test_name_is_shortened_when_it_overflows() {
        let mut builder = AdvertisementBuilder::new();
        builder.flags(AdFlags::GENERAL_DISCOVERABLE).unwrap();
        builder
            .local_name("a-device-name-that-is-far-too-long-for-one-pdu")
            .unwrap();
        let packet = builder.build();

        assert_eq!(packet.len(), MAX_ADVERTISEMENT_LEN);
        let fields = packet.fields().unwrap();
        assert_eq!(fields[1].ad_type, ad_type::SHORT_LOCAL_NAME);
        assert_eq!(fields[1].data.len(), 26);
    }

    #[test]
    fn test_name_truncation_respects_char_boundaries() {
        let mut builder = AdvertisementBuilder::new();
        builder.manufacturer_data(0x2333, &[0u8; 23]).unwrap();
        // Two bytes remain for data: "é" is two bytes, "€" is three
        builder.local_name("é€").unwrap();
        let packet = builder.build();
        assert_eq!(packet.local_name().as_deref(), Some("é"));
    }

    #[test]
    fn test_manufacturer_data_overflow_is_rejected() {
        let mut builder = AdvertisementBuilder::new();
        builder.local_name("WeixinBLE").unwrap();
        let before = builder.build();

        let err = builder.manufacturer_data(0x2333, &[0u8; 20]).unwrap_err();
        assert_eq!(
            err,
            AdvertisementError::TooLarge {
                needed: 24,
                available: 20
            }
        );
        assert_eq!(builder.build(), before);
    }

    #[test]
    fn test_uuid_list_degrades_to_incomplete() {
        let uuids: Vec<Uuid16> = (0..20).map(|i| Uuid16::new(0xFE00 + i)).collect();
        let mut builder = AdvertisementBuilder::new();
        builder.flags(AdFlags::LE_ONLY).unwrap();
        builder.service_uuids(&uuids).unwrap();
        let packet = builder.build();

        let fields = packet.fields().unwrap();
        assert_eq!(fields[1].ad_type, ad_type::INCOMPLETE_UUID16);
        // 31 - 3 (flags) - 2 (header) leaves room for 13 UUIDs
        assert_eq!(packet.service_uuids(), uuids[..13].to_vec());
    }

    #[test]
    fn test_uuid128_list() {
        let uuid = WECHAT_SERVICE.to_uuid();
        let mut builder = AdvertisementBuilder::new();
        builder.service_uuids_128(&[uuid]).unwrap();
        let packet = builder.build();
        assert_eq!(packet.fields().unwrap()[0].ad_type, ad_type::COMPLETE_UUID128);
        assert_eq!(packet.service_uuids_128(), vec![uuid]);

        // A second 128-bit list no longer fits
        let err = builder.service_uuids_128(&[uuid]).unwrap_err();
        assert!(matches!(err, AdvertisementError::TooLarge { .. }));
    }

    #[test]
    fn test_empty_uuid_list() {
        let mut builder = AdvertisementBuilder::new();
        assert_eq!(
            builder.service_uuids(&[]).unwrap_err(),
            AdvertisementError::EmptyUuidList
        );
        assert!(builder.is_empty());
    }

    #[test]
    fn test_from_bytes_validates_layout() {
        assert!(AdvertisementPacket::from_bytes(&[0x02, 0x01, 0x06]).is_ok());
        assert_eq!(
            AdvertisementPacket::from_bytes(&[0x02, 0x01, 0x06, 0x05, 0x09, b'a']),
            Err(AdvertisementError::Malformed { offset: 3 })
        );
        assert!(AdvertisementPacket::from_bytes(&[0u8; 32]).is_err());
    }
}
